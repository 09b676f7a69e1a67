//! Property-based tests for the transport state machine
//!
//! Applies arbitrary interleavings of application calls and provider
//! notifications and checks the invariants that must hold after every step.

use iothub_device::testing::{MockAuthProvider, MockProvider};
use iothub_device::transport::{ConnectionState, MessageId, TransportStateMachine};
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Step {
    Connect,
    Send,
    Disconnect,
    Connected,
    Disconnected,
    Ack(u64),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        1 => Just(Step::Connect),
        3 => Just(Step::Send),
        1 => Just(Step::Disconnect),
        2 => Just(Step::Connected),
        1 => Just(Step::Disconnected),
        3 => (0u64..12).prop_map(Step::Ack),
    ]
}

struct Run {
    machine: TransportStateMachine,
    provider: Arc<MockProvider>,
    fired: Vec<Arc<AtomicUsize>>,
}

impl Run {
    fn new() -> Self {
        let provider = Arc::new(MockProvider::new());
        let auth = Arc::new(MockAuthProvider::new("MyPensieve"));
        Self {
            machine: TransportStateMachine::new(auth, provider.clone()),
            provider,
            fired: Vec::new(),
        }
    }

    async fn apply(&mut self, step: &Step) {
        match step {
            Step::Connect => {
                let _ = self.machine.connect().await;
            }
            Step::Send => {
                let count = Arc::new(AtomicUsize::new(0));
                let callback_count = count.clone();
                let result = self
                    .machine
                    .send_event(
                        "payload",
                        Some(Box::new(move || {
                            callback_count.fetch_add(1, Ordering::SeqCst);
                        })),
                    )
                    .await;
                if result.is_ok() {
                    self.fired.push(count);
                }
            }
            Step::Disconnect => {
                let _ = self.machine.disconnect().await;
            }
            Step::Connected => self.machine.on_connected().await,
            Step::Disconnected => self.machine.on_disconnected(),
            Step::Ack(id) => self.machine.on_published(MessageId(*id)),
        }
    }

    fn total_fired(&self) -> usize {
        self.fired.iter().map(|c| c.load(Ordering::SeqCst)).sum()
    }
}

proptest! {
    #[test]
    fn callbacks_fire_at_most_once(steps in prop::collection::vec(step(), 0..60)) {
        tokio_test::block_on(async {
            let mut run = Run::new();
            for step in &steps {
                run.apply(step).await;
            }

            for count in &run.fired {
                prop_assert!(count.load(Ordering::SeqCst) <= 1);
            }
            prop_assert!(run.total_fired() <= run.provider.published().len());
            Ok::<(), TestCaseError>(())
        })?;
    }

    #[test]
    fn queue_only_holds_events_while_not_connected(steps in prop::collection::vec(step(), 0..60)) {
        tokio_test::block_on(async {
            let mut run = Run::new();
            for step in &steps {
                run.apply(step).await;

                let state = run.machine.state();
                if state == ConnectionState::Connected {
                    prop_assert_eq!(run.machine.pending_count(), 0, "after {:?}", step);
                }
                if state == ConnectionState::Disconnected {
                    prop_assert_eq!(run.machine.pending_count(), 0, "after {:?}", step);
                    prop_assert_eq!(run.machine.in_flight_count(), 0, "after {:?}", step);
                }
            }
            Ok::<(), TestCaseError>(())
        })?;
    }

    #[test]
    fn every_accepted_event_is_accounted_for(steps in prop::collection::vec(step(), 0..60)) {
        tokio_test::block_on(async {
            let mut run = Run::new();
            for step in &steps {
                run.apply(step).await;
            }

            // Accepted events are queued, in flight, acknowledged or abandoned
            let live = run.machine.pending_count() + run.machine.in_flight_count();
            prop_assert!(live + run.total_fired() <= run.fired.len());
            Ok::<(), TestCaseError>(())
        })?;
    }

    #[test]
    fn connect_calls_match_connecting_transitions(steps in prop::collection::vec(step(), 0..60)) {
        tokio_test::block_on(async {
            let mut run = Run::new();
            let mut entered_connecting = 0;
            for step in &steps {
                let before = run.machine.state();
                run.apply(step).await;
                if before == ConnectionState::Disconnected
                    && run.machine.state() == ConnectionState::Connecting
                {
                    entered_connecting += 1;
                }
            }

            prop_assert_eq!(run.provider.connect_count(), entered_connecting);
            Ok::<(), TestCaseError>(())
        })?;
    }
}

#[test]
fn scripted_run_reaches_expected_state() {
    tokio_test::block_on(async {
        let mut run = Run::new();
        for step in [
            Step::Send,
            Step::Send,
            Step::Connected,
            Step::Ack(1),
            Step::Send,
            Step::Ack(0),
        ] {
            run.apply(&step).await;
        }

        assert_eq!(run.machine.state(), ConnectionState::Connected);
        assert_eq!(run.machine.in_flight_count(), 1);
        assert_eq!(run.total_fired(), 2);
    });
}
