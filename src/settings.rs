//! Oxidimse settings, which are configurable using environment variables.
use std::sync::Arc;
use std::time::Duration;

use aliri_braid::braid;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use serde::Deserialize;

use crate::config::get_config;
use crate::negotiation::{AcceptorPolicy, UsernamePasscode};
use crate::pdu::DEFAULT_MAX_PDU;
use crate::scp::ServerOptions;
use crate::statistics::StatisticsSink;
use crate::uids;

/// An application entity title.
#[braid(serde)]
pub struct AeTitle;

#[derive(Debug, Deserialize)]
pub struct OxidimseEnvOptions {
    #[serde(default = "default_listener_port")]
    pub listener_port: u16,
    #[serde(default)]
    pub scp: ScpSettings,
    /// Largest P-DATA-TF body we receive. 0 means unlimited.
    #[serde(default = "default_max_pdu_length")]
    pub max_pdu_length: u32,
    #[serde(default = "default_association_timeout", with = "humantime_serde")]
    pub association_timeout: Duration,
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Export traffic statistics as OpenTelemetry metrics over OTLP.
    #[serde(default)]
    pub otel_metrics: bool,
}

#[derive(Debug, Deserialize)]
pub struct ScpSettings {
    /// Our AE title.
    #[serde(default = "default_aet")]
    pub aet: AeTitle,
    /// Whether receiving PDUs must not surpass the negotiated maximum PDU length.
    #[serde(default)]
    pub strict: bool,
    /// Only accept uncompressed transfer syntaxes.
    #[serde(default)]
    pub uncompressed_only: bool,
    /// Whether to accept unknown abstract syntaxes.
    #[serde(default)]
    pub promiscuous: bool,
    /// Reject associations whose called AE title is not ours.
    #[serde(default)]
    pub require_called_aet: bool,
    /// Only these peers may associate. Empty means anyone.
    #[serde(default)]
    pub allowed_calling_aets: Vec<AeTitle>,
    /// Require this username and `password` when a peer sends a user identity.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for ScpSettings {
    fn default() -> Self {
        Self {
            aet: default_aet(),
            strict: false,
            uncompressed_only: false,
            promiscuous: false,
            require_called_aet: false,
            allowed_calling_aets: Vec::new(),
            username: None,
            password: None,
        }
    }
}

impl OxidimseEnvOptions {
    /// Read the settings from `OXIDIMSE_*` environment variables.
    pub fn from_env() -> Result<Self, figment::Error> {
        get_config().extract()
    }

    pub fn acceptor_policy(&self) -> AcceptorPolicy {
        self.scp.to_policy(self.max_pdu_length)
    }

    pub fn server_options(&self, statistics: Arc<dyn StatisticsSink>) -> ServerOptions {
        ServerOptions {
            strict: self.scp.strict,
            association_timeout: self.association_timeout,
            idle_timeout: self.idle_timeout,
            statistics,
        }
    }
}

impl ScpSettings {
    pub fn to_policy(&self, max_pdu_length: u32) -> AcceptorPolicy {
        let transfer_syntaxes = if self.uncompressed_only {
            vec![
                uids::transfer_syntax::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
                uids::transfer_syntax::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
            ]
        } else {
            TransferSyntaxRegistry
                .iter()
                .filter(|ts| !ts.is_unsupported())
                .map(|ts| ts.uid().to_string())
                .collect()
        };
        let mut policy = AcceptorPolicy {
            ae_title: self.aet.to_string(),
            require_called_ae_title: self.require_called_aet,
            allowed_calling_ae_titles: self
                .allowed_calling_aets
                .iter()
                .map(|aet| aet.to_string())
                .collect(),
            transfer_syntaxes,
            promiscuous: self.promiscuous,
            max_pdu_length,
            ..Default::default()
        };
        if let Some(username) = &self.username {
            let password = self.password.as_deref().unwrap_or_default();
            policy = policy.with_identity_verifier(UsernamePasscode::new(username, password));
        }
        policy
    }
}

fn default_aet() -> AeTitle {
    AeTitle::from_static("OXIDIMSE")
}

fn default_listener_port() -> u16 {
    11112
}

fn default_max_pdu_length() -> u32 {
    DEFAULT_MAX_PDU
}

fn default_association_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(60)
}
