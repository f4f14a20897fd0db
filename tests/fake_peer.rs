//! A client against a scripted acceptor, over an in-memory transport.

mod util;

use std::sync::Arc;
use std::time::Duration;

use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use oxidimse::association::{AssociationEvent, InboundMessage, Role};
use oxidimse::pdu::{AbortReason, AbortSource, Pdu};
use oxidimse::uids::{sop_class, storage_class};
use oxidimse::{
    AcceptorPolicy, Client, ClientEvent, ClientOptions, CommandField, Connection, Message,
    Statistics, Status,
};
use pretty_assertions::assert_eq;
use tokio::io::DuplexStream;
use util::helpers::{collect, init_logging};

const WAIT: Duration = Duration::from_secs(5);

fn patient(id: &str) -> InMemDicomObject {
    InMemDicomObject::from_element_iter([DataElement::new(
        tags::PATIENT_ID,
        VR::LO,
        dicom_value!(Str, id),
    )])
}

/// Accept whatever the default policy accepts.
async fn accept(stream: DuplexStream) -> Connection<DuplexStream> {
    let mut connection = Connection::new(
        stream,
        Role::Acceptor,
        16384,
        false,
        Arc::new(Statistics::default()),
    );
    let event = connection.next_event(WAIT, "A-ASSOCIATE-RQ").await.unwrap();
    let Some(AssociationEvent::Requested(rq)) = event else {
        panic!("expected an association request, got {event:?}");
    };
    let ac = AcceptorPolicy::default().evaluate(&rq).unwrap();
    connection.send_pdu(&Pdu::AssociationAC(ac)).await.unwrap();
    connection
}

async fn next_message(connection: &mut Connection<DuplexStream>) -> InboundMessage {
    match connection.next_event(WAIT, "a message").await.unwrap() {
        Some(AssociationEvent::Message(inbound)) => inbound,
        other => panic!("expected a message, got {other:?}"),
    }
}

async fn release(connection: &mut Connection<DuplexStream>) {
    let event = connection.next_event(WAIT, "A-RELEASE-RQ").await.unwrap();
    assert_eq!(event, Some(AssociationEvent::ReleaseRequested));
    connection.send_pdu(&Pdu::ReleaseRP).await.unwrap();
    connection.close().await;
}

#[tokio::test]
async fn test_cancel_find() {
    init_logging();
    let (client_io, peer_io) = tokio::io::duplex(64 * 1024);

    let mut client = Client::new(ClientOptions::default());
    let events = client.subscribe();
    let mut find = client.add_request(Message::c_find_study(patient("*")));

    let peer = async move {
        let mut connection = accept(peer_io).await;
        let request = next_message(&mut connection).await;
        assert_eq!(request.command.command_field, CommandField::CFindRq);
        let pc = request.presentation_context_id;

        let mut stranger = request.command.clone();
        stranger.message_id = Some(99);
        let unrelated = Message::response_to(&stranger, Status::SUCCESS, None).unwrap();
        connection.send_message(pc, &unrelated).await.unwrap();
        let pending =
            Message::response_to(&request.command, Status::PENDING, Some(patient("1"))).unwrap();
        connection.send_message(pc, &pending).await.unwrap();

        let cancel = next_message(&mut connection).await;
        assert_eq!(cancel.command.command_field, CommandField::CCancelRq);
        assert_eq!(cancel.command.message_id_being_responded_to, Some(1));
        let cancelled = Message::response_to(&request.command, Status::CANCEL, None).unwrap();
        connection.send_message(pc, &cancelled).await.unwrap();
        release(&mut connection).await;
    };
    let driver = async move {
        let first = find.next_response().await.unwrap();
        assert_eq!(first.status(), Some(Status::PENDING));
        find.cancel();
        let rest = find.responses().await;
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].status(), Some(Status::CANCEL));
        assert_eq!(rest[0].command.message_id_being_responded_to, Some(1));
    };
    let (result, (), ()) = tokio::join!(client.send_over(client_io), peer, driver);
    result.unwrap();

    let events = collect(events).await;
    assert!(matches!(events[0], ClientEvent::Accepted(_)));
    assert_eq!(
        events[1..].to_vec(),
        vec![ClientEvent::Released, ClientEvent::Closed]
    );
}

#[tokio::test]
async fn test_peer_aborts_during_operation() {
    init_logging();
    let (client_io, peer_io) = tokio::io::duplex(64 * 1024);

    let mut client = Client::new(ClientOptions::default());
    let events = client.subscribe();
    let find = client.add_request(Message::c_find_study(patient("1")));

    let peer = async move {
        let mut connection = accept(peer_io).await;
        next_message(&mut connection).await;
        connection
            .abort(AbortSource::ServiceUser, AbortReason::NotSpecified)
            .await;
    };
    let (result, ()) = tokio::join!(client.send_over(client_io), peer);
    result.unwrap();

    assert_eq!(find.responses().await, vec![]);
    let events = collect(events).await;
    assert!(matches!(events[0], ClientEvent::Accepted(_)));
    assert_eq!(
        events[1..].to_vec(),
        vec![
            ClientEvent::Aborted {
                source: AbortSource::ServiceUser,
                reason: AbortReason::NotSpecified,
            },
            ClientEvent::Closed,
        ]
    );
}

#[tokio::test]
async fn test_get_receives_store_sub_operation() {
    init_logging();
    let (client_io, peer_io) = tokio::io::duplex(64 * 1024);

    let mut client = Client::new(ClientOptions::default().with_scp_role(storage_class::CT_IMAGE));
    let get = client.add_request(Message::c_get(
        sop_class::PATIENT_ROOT_QUERY_RETRIEVE_GET,
        patient("1"),
    ));

    let peer = async move {
        let mut connection = accept(peer_io).await;
        let request = next_message(&mut connection).await;
        assert_eq!(request.command.command_field, CommandField::CGetRq);

        let mut instance = patient("1");
        instance.put(DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, storage_class::CT_IMAGE),
        ));
        instance.put(DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, "1.2.3.4"),
        ));
        let mut store = Message::c_store(instance).unwrap();
        store.command.message_id = Some(1);
        let ct = connection
            .association()
            .accepted_context_for(storage_class::CT_IMAGE)
            .unwrap()
            .id;
        connection.send_message(ct, &store).await.unwrap();

        let stored = next_message(&mut connection).await;
        assert_eq!(stored.command.command_field, CommandField::CStoreRsp);
        assert_eq!(stored.command.status, Some(Status::SUCCESS));
        assert_eq!(stored.command.message_id_being_responded_to, Some(1));
        assert_eq!(
            stored.command.affected_sop_instance_uid.as_deref(),
            Some("1.2.3.4")
        );

        let done = Message::response_to(&request.command, Status::SUCCESS, None).unwrap();
        connection
            .send_message(request.presentation_context_id, &done)
            .await
            .unwrap();
        release(&mut connection).await;
    };
    let (result, ()) = tokio::join!(client.send_over(client_io), peer);
    result.unwrap();

    let responses = get.responses().await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].status(), Some(Status::SUCCESS));
}
