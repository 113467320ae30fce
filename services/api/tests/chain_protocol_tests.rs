//! Wire-level protocol checks: event decoding, status mapping, and the
//! transaction status lattice, using locally constructed payloads the way
//! the node would serve them.

use bithedge_api::chain::contracts::{encode_stacks_address, ClarityValue, ContractCall};
use bithedge_api::chain::events::{decode_event, ChainEventBody};
use bithedge_api::chain::{map_tx_status, RawContractEvent};
use bithedge_api::db::types::{TokenKind, TxStatus};

fn owner_address() -> String {
    encode_stacks_address(26, &[0x11; 20])
}

fn ascii(value: &str) -> ClarityValue {
    ClarityValue::StringAscii(value.to_string())
}

fn policy_created_tuple() -> ClarityValue {
    let (version, hash160) = bithedge_api::chain::contracts::decode_stacks_address(&owner_address()).unwrap();
    ClarityValue::Tuple(vec![
        ("event".into(), ascii("policy-created")),
        ("policy-id".into(), ClarityValue::Uint(7)),
        ("owner".into(), ClarityValue::Principal { version, hash160 }),
        ("policy-type".into(), ascii("PUT     ")),
        ("strike".into(), ClarityValue::Uint(4_500_000)),
        ("amount".into(), ClarityValue::Uint(50_000_000)),
        ("premium".into(), ClarityValue::Uint(612_000_000)),
        ("expiration-height".into(), ClarityValue::Uint(154_320)),
        ("collateral-token".into(), ascii("sbtc")),
        ("settlement-token".into(), ascii("sbtc")),
    ])
}

#[test]
fn policy_created_event_round_trips_through_the_wire() {
    let tuple = policy_created_tuple();
    let bytes = tuple.serialize();
    let raw = RawContractEvent {
        tx_id: "0xabc123".to_string(),
        event_index: 0,
        value: ClarityValue::deserialize(&bytes).unwrap(),
    };

    let event = decode_event(&raw).unwrap().expect("recognized topic");
    assert_eq!(event.tx_id, "0xabc123");
    match event.body {
        ChainEventBody::PolicyCreated {
            on_chain_id,
            owner,
            policy_type,
            strike_cents,
            amount_sats,
            premium_micro,
            expiration_height,
            collateral_token,
            settlement_token,
        } => {
            assert_eq!(on_chain_id, 7);
            assert_eq!(owner, owner_address());
            // Right-padded strings come back trimmed.
            assert_eq!(policy_type, "PUT");
            assert_eq!(strike_cents, 4_500_000);
            assert_eq!(amount_sats, 50_000_000);
            assert_eq!(premium_micro, 612_000_000);
            assert_eq!(expiration_height, 154_320);
            assert_eq!(collateral_token, TokenKind::WrappedBtc);
            assert_eq!(settlement_token, TokenKind::WrappedBtc);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn status_update_event_carries_optional_settlement() {
    let with_settlement = ClarityValue::Tuple(vec![
        ("event".into(), ascii("policy-status-updated")),
        ("policy-id".into(), ClarityValue::Uint(7)),
        ("previous".into(), ClarityValue::Uint(0)),
        ("new".into(), ClarityValue::Uint(1)),
        (
            "settlement".into(),
            ClarityValue::Some(Box::new(ClarityValue::Uint(200_000))),
        ),
    ]);
    let raw = RawContractEvent {
        tx_id: "0xdef".to_string(),
        event_index: 1,
        value: with_settlement,
    };
    match decode_event(&raw).unwrap().unwrap().body {
        ChainEventBody::PolicyStatusUpdated {
            new_code,
            settlement,
            ..
        } => {
            assert_eq!(new_code, 1);
            assert_eq!(settlement, Some(200_000));
        }
        other => panic!("unexpected event {other:?}"),
    }

    let without = ClarityValue::Tuple(vec![
        ("event".into(), ascii("policy-status-updated")),
        ("policy-id".into(), ClarityValue::Uint(7)),
        ("previous".into(), ClarityValue::Uint(0)),
        ("new".into(), ClarityValue::Uint(2)),
        ("settlement".into(), ClarityValue::None),
    ]);
    let raw = RawContractEvent {
        tx_id: "0xdef".to_string(),
        event_index: 2,
        value: without,
    };
    match decode_event(&raw).unwrap().unwrap().body {
        ChainEventBody::PolicyStatusUpdated { settlement, .. } => assert_eq!(settlement, None),
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn unknown_topics_are_skipped_not_errors() {
    let foreign = ClarityValue::Tuple(vec![
        ("event".into(), ascii("governance-vote")),
        ("proposal".into(), ClarityValue::Uint(12)),
    ]);
    let raw = RawContractEvent {
        tx_id: "0x999".to_string(),
        event_index: 0,
        value: foreign,
    };
    assert!(decode_event(&raw).unwrap().is_none());

    let not_a_print = RawContractEvent {
        tx_id: "0x999".to_string(),
        event_index: 1,
        value: ClarityValue::Uint(1),
    };
    assert!(decode_event(&not_a_print).unwrap().is_none());
}

#[test]
fn node_statuses_map_onto_the_lattice() {
    assert_eq!(map_tx_status("success").0, TxStatus::Confirmed);
    assert_eq!(map_tx_status("pending").0, TxStatus::Pending);
    assert_eq!(map_tx_status("failed").0, TxStatus::Failed);
    assert_eq!(map_tx_status("abort_by_post_condition").0, TxStatus::Failed);
    assert_eq!(map_tx_status("dropped_replace_by_fee").0, TxStatus::Replaced);

    // Unknown strings stay pending with a note rather than failing.
    let (status, note) = map_tx_status("some_future_status");
    assert_eq!(status, TxStatus::Pending);
    assert!(note.is_some());

    // Failure mappings carry an error detail.
    assert!(map_tx_status("abort_by_post_condition").1.is_some());
    assert!(map_tx_status("success").1.is_none());
}

#[test]
fn transaction_status_ranks_are_monotone() {
    let order = [
        TxStatus::Pending,
        TxStatus::Submitted,
        TxStatus::Confirmed,
        TxStatus::Failed,
        TxStatus::Replaced,
        TxStatus::Expired,
    ];
    for status in order {
        assert!(status.rank() <= 2);
    }
    assert!(TxStatus::Pending.rank() < TxStatus::Submitted.rank());
    assert!(TxStatus::Submitted.rank() < TxStatus::Failed.rank());
    for terminal in [TxStatus::Confirmed, TxStatus::Failed, TxStatus::Replaced, TxStatus::Expired] {
        assert!(terminal.is_terminal());
        assert_eq!(terminal.rank(), TxStatus::Confirmed.rank());
    }
}

#[test]
fn create_policy_call_serializes_padded_strings() {
    let registry = format!("{}.policy-registry", encode_stacks_address(26, &[0x22; 20]));
    let call = ContractCall::new(
        &registry,
        "create-protection-policy",
        vec![
            ClarityValue::principal(&owner_address()).unwrap(),
            ClarityValue::padded_ascii("PUT", 8).unwrap(),
            ClarityValue::padded_ascii("balanced", 32).unwrap(),
            ClarityValue::padded_ascii("BTC", 10).unwrap(),
            ClarityValue::padded_ascii("sbtc", 32).unwrap(),
            ClarityValue::Uint(4_500_000),
            ClarityValue::Uint(50_000_000),
            ClarityValue::Uint(154_320),
            ClarityValue::Uint(612_000_000),
        ],
    )
    .unwrap();

    let payload = call.serialize_payload().unwrap();
    // Declared argument order survives serialization.
    let needle = b"create-protection-policy";
    assert!(payload
        .windows(needle.len())
        .any(|window| window == needle));

    // Each padded string is exactly its declared width on the wire.
    if let ClarityValue::StringAscii(tier) = &call.args[2] {
        assert_eq!(tier.len(), 32);
        assert!(tier.starts_with("balanced"));
        assert!(tier.ends_with(' '));
    } else {
        panic!("tier argument is not a string");
    }
}
