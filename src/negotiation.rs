//! Presentation context negotiation, and the checks an acceptor applies to an association request.

use std::fmt;
use std::sync::Arc;

use crate::pdu::{
    APPLICATION_CONTEXT_NAME, AcseReason, AssociationAC, AssociationRJ, AssociationRQ,
    DEFAULT_MAX_PDU, PROTOCOL_VERSION, PresentationContextProposed, PresentationContextResult,
    PresentationContextResultReason, RejectResult, RejectSource, ServiceUserReason, UserIdentity,
    UserIdentityType, UserVariableItem,
};
use crate::uids;

/// Settle each proposed context against what we support.
///
/// The chosen transfer syntax is the first one in the proposer's list that we support,
/// whatever order `transfer_syntaxes` lists them in. A transfer syntax is only supported
/// when it is listed and we can also read and write data sets in it.
pub fn negotiate(
    proposed: &[PresentationContextProposed],
    abstract_syntaxes: &[String],
    transfer_syntaxes: &[String],
) -> Vec<PresentationContextResult> {
    negotiate_with(
        proposed,
        |uid| abstract_syntaxes.iter().any(|a| a == uid),
        transfer_syntaxes,
    )
}

fn negotiate_with(
    proposed: &[PresentationContextProposed],
    supports_abstract_syntax: impl Fn(&str) -> bool,
    transfer_syntaxes: &[String],
) -> Vec<PresentationContextResult> {
    let mut seen = Vec::with_capacity(proposed.len());
    proposed
        .iter()
        .map(|pc| {
            let result = if pc.id % 2 == 0 || seen.contains(&pc.id) || pc.transfer_syntaxes.is_empty()
            {
                rejection(pc.id, PresentationContextResultReason::NoReason)
            } else if !supports_abstract_syntax(trim_uid(&pc.abstract_syntax)) {
                rejection(pc.id, PresentationContextResultReason::AbstractSyntaxNotSupported)
            } else {
                pc.transfer_syntaxes
                    .iter()
                    .map(|ts| trim_uid(ts))
                    .find(|ts| {
                        transfer_syntaxes.iter().any(|local| local == ts)
                            && crate::dataset::is_supported(ts)
                    })
                    .map(|ts| PresentationContextResult {
                        id: pc.id,
                        reason: PresentationContextResultReason::Acceptance,
                        transfer_syntax: Some(ts.to_string()),
                    })
                    .unwrap_or_else(|| {
                        rejection(pc.id, PresentationContextResultReason::TransferSyntaxesNotSupported)
                    })
            };
            seen.push(pc.id);
            result
        })
        .collect()
}

fn rejection(id: u8, reason: PresentationContextResultReason) -> PresentationContextResult {
    PresentationContextResult {
        id,
        reason,
        transfer_syntax: None,
    }
}

fn trim_uid(uid: &str) -> &str {
    uid.trim_end_matches(['\0', ' '])
}

/// Decides whether a user identity is acceptable.
pub trait UserIdentityVerifier: Send + Sync + fmt::Debug {
    /// `Some(server_response)` accepts the identity, `None` rejects the association.
    fn verify(&self, identity: &UserIdentity) -> Option<Vec<u8>>;
}

/// Accepts exactly one username and passcode pair.
#[derive(Clone)]
pub struct UsernamePasscode {
    username: String,
    passcode: String,
}

impl UsernamePasscode {
    pub fn new(username: impl Into<String>, passcode: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            passcode: passcode.into(),
        }
    }
}

impl fmt::Debug for UsernamePasscode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsernamePasscode")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl UserIdentityVerifier for UsernamePasscode {
    fn verify(&self, identity: &UserIdentity) -> Option<Vec<u8>> {
        let matches = identity.identity_type == UserIdentityType::UsernamePasscode
            && identity.primary_field == self.username.as_bytes()
            && identity.secondary_field == self.passcode.as_bytes();
        matches.then(Vec::new)
    }
}

/// What an acceptor will agree to.
#[derive(Debug, Clone)]
pub struct AcceptorPolicy {
    pub ae_title: String,
    /// Reject requests whose called AE title is not ours.
    pub require_called_ae_title: bool,
    /// Empty means any calling AE title.
    pub allowed_calling_ae_titles: Vec<String>,
    pub abstract_syntaxes: Vec<String>,
    pub transfer_syntaxes: Vec<String>,
    /// Accept any abstract syntax.
    pub promiscuous: bool,
    /// Largest P-DATA-TF we receive. 0 means unlimited.
    pub max_pdu_length: u32,
    pub identity_verifier: Option<Arc<dyn UserIdentityVerifier>>,
}

impl Default for AcceptorPolicy {
    fn default() -> Self {
        Self {
            ae_title: "ANY-SCP".to_string(),
            require_called_ae_title: false,
            allowed_calling_ae_titles: Vec::new(),
            abstract_syntaxes: uids::abstract_syntaxes().map(str::to_string).collect(),
            transfer_syntaxes: uids::UNCOMPRESSED_TRANSFER_SYNTAXES
                .iter()
                .map(|ts| ts.to_string())
                .collect(),
            promiscuous: false,
            max_pdu_length: DEFAULT_MAX_PDU,
            identity_verifier: None,
        }
    }
}

impl AcceptorPolicy {
    pub fn new(ae_title: impl Into<String>) -> Self {
        Self {
            ae_title: ae_title.into(),
            ..Default::default()
        }
    }

    pub fn with_allowed_calling_ae_title(mut self, ae_title: impl Into<String>) -> Self {
        self.allowed_calling_ae_titles.push(ae_title.into());
        self
    }

    pub fn with_abstract_syntax(mut self, uid: impl Into<String>) -> Self {
        self.abstract_syntaxes.push(uid.into());
        self
    }

    pub fn with_transfer_syntax(mut self, uid: impl Into<String>) -> Self {
        self.transfer_syntaxes.push(uid.into());
        self
    }

    pub fn with_identity_verifier(mut self, verifier: impl UserIdentityVerifier + 'static) -> Self {
        self.identity_verifier = Some(Arc::new(verifier));
        self
    }

    pub fn promiscuous(mut self, promiscuous: bool) -> Self {
        self.promiscuous = promiscuous;
        self
    }

    pub fn require_called_ae_title(mut self, require: bool) -> Self {
        self.require_called_ae_title = require;
        self
    }

    pub fn max_pdu_length(mut self, max_pdu_length: u32) -> Self {
        self.max_pdu_length = max_pdu_length;
        self
    }

    /// Accept or reject an association request.
    ///
    /// Checks run in order: protocol version, application context, called AE title, calling AE
    /// title, user identity. An accepted association may still have no accepted context.
    pub fn evaluate(&self, rq: &AssociationRQ) -> Result<AssociationAC, AssociationRJ> {
        let reject = |source| AssociationRJ {
            result: RejectResult::Permanent,
            source,
        };
        if rq.protocol_version & PROTOCOL_VERSION == 0 {
            return Err(reject(RejectSource::ServiceProviderAcse(
                AcseReason::ProtocolVersionNotSupported,
            )));
        }
        if trim_uid(&rq.application_context_name) != APPLICATION_CONTEXT_NAME {
            return Err(reject(RejectSource::ServiceUser(
                ServiceUserReason::ApplicationContextNameNotSupported,
            )));
        }
        if self.require_called_ae_title && rq.called_ae_title != self.ae_title {
            return Err(reject(RejectSource::ServiceUser(
                ServiceUserReason::CalledAeTitleNotRecognized,
            )));
        }
        if !self.allowed_calling_ae_titles.is_empty()
            && !self
                .allowed_calling_ae_titles
                .iter()
                .any(|aet| *aet == rq.calling_ae_title)
        {
            return Err(reject(RejectSource::ServiceUser(
                ServiceUserReason::CallingAeTitleNotRecognized,
            )));
        }

        let identity = rq.user_variables.iter().find_map(|item| match item {
            UserVariableItem::UserIdentityRq(identity) => Some(identity),
            _ => None,
        });
        let mut user_variables = vec![
            UserVariableItem::MaxLength(self.max_pdu_length),
            UserVariableItem::ImplementationClassUid(uids::IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariableItem::ImplementationVersionName(
                uids::IMPLEMENTATION_VERSION_NAME.to_string(),
            ),
        ];
        if let (Some(verifier), Some(identity)) = (&self.identity_verifier, identity) {
            let Some(server_response) = verifier.verify(identity) else {
                tracing::debug!(
                    calling_ae_title = %rq.calling_ae_title,
                    "user identity rejected"
                );
                return Err(reject(RejectSource::ServiceUser(
                    ServiceUserReason::NoReasonGiven,
                )));
            };
            if identity.positive_response_requested {
                user_variables.push(UserVariableItem::UserIdentityAc { server_response });
            }
        }

        let presentation_contexts = negotiate_with(
            &rq.presentation_contexts,
            |uid| self.promiscuous || self.abstract_syntaxes.iter().any(|a| a == uid),
            &self.transfer_syntaxes,
        );
        for result in &presentation_contexts {
            tracing::debug!(
                id = result.id,
                result = ?result.reason,
                transfer_syntax = ?result.transfer_syntax,
                "presentation context negotiated"
            );
        }

        // echo the roles proposed for SOP classes we accepted
        let accepted_class = |uid: &str| {
            rq.presentation_contexts
                .iter()
                .zip(&presentation_contexts)
                .any(|(pc, result)| {
                    result.reason == PresentationContextResultReason::Acceptance
                        && trim_uid(&pc.abstract_syntax) == trim_uid(uid)
                })
        };
        user_variables.extend(rq.user_variables.iter().filter_map(|item| match item {
            UserVariableItem::RoleSelection(role) if accepted_class(&role.sop_class_uid) => {
                Some(UserVariableItem::RoleSelection(role.clone()))
            }
            _ => None,
        }));

        Ok(AssociationAC {
            protocol_version: PROTOCOL_VERSION,
            calling_ae_title: rq.calling_ae_title.clone(),
            called_ae_title: rq.called_ae_title.clone(),
            application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts,
            user_variables,
        })
    }
}
