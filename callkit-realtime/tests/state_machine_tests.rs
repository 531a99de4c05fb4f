//! Property tests for the connection state machine, driven through the
//! negotiator's public operations.

mod common;

use callkit_realtime::{ConnectionStatus, Negotiator};
use common::*;
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::atomic::Ordering;

const ALL: [ConnectionStatus; 5] = [
    ConnectionStatus::Idle,
    ConnectionStatus::Connecting,
    ConnectionStatus::Connected,
    ConnectionStatus::Disconnected,
    ConnectionStatus::Error,
];

#[test]
fn test_edge_table() {
    use ConnectionStatus::*;
    let allowed: HashSet<(ConnectionStatus, ConnectionStatus)> = [
        (Idle, Connecting),
        (Connecting, Connected),
        (Connecting, Error),
        (Connected, Error),
        (Error, Connecting),
        (Disconnected, Connecting),
        (Idle, Disconnected),
        (Connecting, Disconnected),
        (Connected, Disconnected),
        (Error, Disconnected),
    ]
    .into_iter()
    .collect();

    for from in ALL {
        for to in ALL {
            assert_eq!(
                from.can_transition_to(to),
                allowed.contains(&(from, to)),
                "{from} -> {to}"
            );
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Connect,
    Disconnect,
    ToggleMute,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Connect),
        2 => Just(Op::Disconnect),
        2 => Just(Op::ToggleMute),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(40))]

    /// Any interleaving of operations only ever walks allowed edges, with capture
    /// granted or denied, and once disconnected every transport and track has
    /// been released exactly once.
    #[test]
    fn prop_operations_walk_allowed_edges(ops in proptest::collection::vec(arb_op(), 1..12)) {
        runtime().block_on(async {
            let granting = FakeDevices::granting();
            let denying = FakeDevices::new(CaptureBehaviour::Deny);
            let transports = FakeTransports::silent();
            let signaling = FakeSignaling::answering();
            let build = |devices: &FakeDevices| {
                Negotiator::builder()
                    .devices(devices.clone())
                    .transports(transports.clone())
                    .signaling(signaling.clone())
                    .build()
                    .unwrap()
            };
            let ok = build(&granting);
            let denied = build(&denying);

            for negotiator in [&ok, &denied] {
                let mut rx = negotiator.subscribe();
                let mut previous = rx.borrow().status;
                for op in &ops {
                    match op {
                        Op::Connect => {
                            negotiator.connect(credential("tok")).await;
                        }
                        Op::Disconnect => negotiator.disconnect(),
                        Op::ToggleMute => {
                            negotiator.toggle_mute();
                        }
                    }
                    let current = rx.borrow_and_update().status;
                    if current != previous {
                        // several transitions may have been coalesced, e.g.
                        // Connecting -> Error inside one connect
                        let direct = previous.can_transition_to(current);
                        let via_connecting = previous.can_transition_to(ConnectionStatus::Connecting)
                            && ConnectionStatus::Connecting.can_transition_to(current);
                        let via_reset = previous == ConnectionStatus::Connected
                            && current == ConnectionStatus::Connecting;
                        prop_assert!(direct || via_connecting || via_reset, "{previous} -> {current}");
                    }
                    previous = current;
                }

                negotiator.disconnect();
                prop_assert_eq!(negotiator.status(), ConnectionStatus::Disconnected);
            }

            prop_assert!(granting.all_stopped());
            for transport in transports.created.lock().iter() {
                prop_assert_eq!(transport.close_calls.load(Ordering::SeqCst), 1);
                prop_assert!(transport.channel_close_calls() <= 1);
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
