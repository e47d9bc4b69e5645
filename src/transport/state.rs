//! Broker link state machine
//!
//! Pure transition logic: [`LinkMachine::handle`] takes an event and returns
//! the effects the coordinator must carry out. Nothing here touches the
//! network, timers or the bus, so every transition is unit-testable.

use crate::bus::ChannelId;
use crate::protocol::NetworkStatus;
use std::fmt;
use std::time::Duration;

/// Broker link state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connected,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Disconnected => f.write_str("disconnected"),
            LinkState::Connected => f.write_str("connected"),
        }
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Network status read from the bus
    Network(NetworkStatus),
    /// Broker acknowledged the connection handshake
    BrokerConnected,
    /// Broker connection closed, for any reason
    BrokerDisconnected,
    /// New data landed on a payload channel; `direct` marks a pending
    /// payload that should be published without queueing
    Payload { channel: ChannelId, direct: bool },
}

/// Side effects requested by a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    ScheduleConnect(Duration),
    CancelConnect,
    CancelDrain,
    DisconnectBroker,
    PublishLogin,
    SubscribeCommands,
    KickDrain,
    PublishPending,
}

/// What a transition did to the state, for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Stay,
    Entered(LinkState),
}

/// The broker link state machine
#[derive(Debug, Clone)]
pub struct LinkMachine {
    state: LinkState,
    settle_delay: Duration,
    reconnect_period: Duration,
}

impl LinkMachine {
    pub fn new(settle_delay: Duration, reconnect_period: Duration) -> Self {
        Self {
            state: LinkState::Disconnected,
            settle_delay,
            reconnect_period,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Apply `event` and return the resulting effects in execution order
    ///
    /// `network` is the most recent network status, already updated when
    /// `event` is itself a network event.
    pub fn handle(
        &mut self,
        event: LinkEvent,
        network: NetworkStatus,
    ) -> (Transition, Vec<Effect>) {
        match (self.state, event) {
            (LinkState::Disconnected, LinkEvent::Network(NetworkStatus::Connected)) => (
                Transition::Stay,
                vec![Effect::ScheduleConnect(self.settle_delay)],
            ),
            (LinkState::Disconnected, LinkEvent::Network(NetworkStatus::Disconnected)) => (
                Transition::Stay,
                vec![Effect::CancelConnect, Effect::CancelDrain],
            ),
            (LinkState::Disconnected, LinkEvent::BrokerConnected) => {
                self.state = LinkState::Connected;
                (
                    Transition::Entered(LinkState::Connected),
                    vec![
                        Effect::CancelConnect,
                        Effect::PublishLogin,
                        Effect::SubscribeCommands,
                        Effect::KickDrain,
                    ],
                )
            }
            // A refused attempt re-runs the entry action on the reconnect period
            (LinkState::Disconnected, LinkEvent::BrokerDisconnected) => {
                let effects = if network == NetworkStatus::Connected {
                    vec![Effect::ScheduleConnect(self.reconnect_period)]
                } else {
                    vec![]
                };
                (Transition::Stay, effects)
            }
            (LinkState::Disconnected, LinkEvent::Payload { .. }) => (Transition::Stay, vec![]),

            (LinkState::Connected, LinkEvent::Network(NetworkStatus::Disconnected)) => {
                (Transition::Stay, vec![Effect::DisconnectBroker])
            }
            (LinkState::Connected, LinkEvent::Network(NetworkStatus::Connected)) => {
                (Transition::Stay, vec![])
            }
            (LinkState::Connected, LinkEvent::BrokerConnected) => (Transition::Stay, vec![]),
            (LinkState::Connected, LinkEvent::BrokerDisconnected) => {
                self.state = LinkState::Disconnected;
                let effects = if network == NetworkStatus::Connected {
                    vec![Effect::ScheduleConnect(Duration::ZERO)]
                } else {
                    vec![]
                };
                (Transition::Entered(LinkState::Disconnected), effects)
            }
            (LinkState::Connected, LinkEvent::Payload { direct, .. }) => {
                let mut effects = vec![Effect::KickDrain];
                if direct {
                    effects.push(Effect::PublishPending);
                }
                (Transition::Stay, effects)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SETTLE: Duration = Duration::from_secs(5);
    const PERIOD: Duration = Duration::from_secs(60);

    fn connected_machine() -> LinkMachine {
        let mut machine = LinkMachine::new(SETTLE, PERIOD);
        machine.handle(LinkEvent::BrokerConnected, NetworkStatus::Connected);
        machine
    }

    #[test]
    fn test_network_up_schedules_connect_after_settle_delay() {
        let mut machine = LinkMachine::new(SETTLE, PERIOD);
        let (transition, effects) = machine.handle(
            LinkEvent::Network(NetworkStatus::Connected),
            NetworkStatus::Connected,
        );
        assert_eq!(transition, Transition::Stay);
        assert_eq!(effects, vec![Effect::ScheduleConnect(SETTLE)]);
        assert_eq!(machine.state(), LinkState::Disconnected);
    }

    #[test]
    fn test_handshake_enters_connected() {
        let mut machine = LinkMachine::new(SETTLE, PERIOD);
        let (transition, effects) =
            machine.handle(LinkEvent::BrokerConnected, NetworkStatus::Connected);
        assert_eq!(transition, Transition::Entered(LinkState::Connected));
        assert_eq!(
            effects,
            vec![
                Effect::CancelConnect,
                Effect::PublishLogin,
                Effect::SubscribeCommands,
                Effect::KickDrain
            ]
        );
    }

    #[test]
    fn test_network_down_twice_while_disconnected_is_idempotent() {
        let mut machine = LinkMachine::new(SETTLE, PERIOD);
        let down = LinkEvent::Network(NetworkStatus::Disconnected);
        let (_, first) = machine.handle(down, NetworkStatus::Disconnected);
        let (_, second) = machine.handle(down, NetworkStatus::Disconnected);
        assert_eq!(first, second);
        assert!(!first.iter().any(|e| matches!(e, Effect::ScheduleConnect(_))));
        assert_eq!(machine.state(), LinkState::Disconnected);
    }

    #[test]
    fn test_network_down_while_connected_requests_disconnect() {
        let mut machine = connected_machine();
        let (transition, effects) = machine.handle(
            LinkEvent::Network(NetworkStatus::Disconnected),
            NetworkStatus::Disconnected,
        );
        assert_eq!(transition, Transition::Stay);
        assert_eq!(effects, vec![Effect::DisconnectBroker]);
        assert_eq!(machine.state(), LinkState::Connected);
    }

    #[test]
    fn test_broker_loss_with_network_up_reschedules_immediately() {
        let mut machine = connected_machine();
        let (transition, effects) =
            machine.handle(LinkEvent::BrokerDisconnected, NetworkStatus::Connected);
        assert_eq!(transition, Transition::Entered(LinkState::Disconnected));
        assert_eq!(effects, vec![Effect::ScheduleConnect(Duration::ZERO)]);
    }

    #[test]
    fn test_broker_loss_with_network_down_leaves_connect_unscheduled() {
        let mut machine = connected_machine();
        let (_, effects) =
            machine.handle(LinkEvent::BrokerDisconnected, NetworkStatus::Disconnected);
        assert!(effects.is_empty());
        assert_eq!(machine.state(), LinkState::Disconnected);
    }

    #[test]
    fn test_refused_connect_rearms_on_reconnect_period() {
        let mut machine = LinkMachine::new(SETTLE, PERIOD);
        let (transition, effects) =
            machine.handle(LinkEvent::BrokerDisconnected, NetworkStatus::Connected);
        assert_eq!(transition, Transition::Stay);
        assert_eq!(effects, vec![Effect::ScheduleConnect(PERIOD)]);

        let (_, effects) =
            machine.handle(LinkEvent::BrokerDisconnected, NetworkStatus::Disconnected);
        assert!(effects.is_empty());
        assert_eq!(machine.state(), LinkState::Disconnected);
    }

    #[test]
    fn test_payload_routing() {
        let mut machine = LinkMachine::new(SETTLE, PERIOD);
        let event = LinkEvent::Payload {
            channel: ChannelId::LocationFix,
            direct: false,
        };
        assert!(machine.handle(event, NetworkStatus::Connected).1.is_empty());

        let mut machine = connected_machine();
        assert_eq!(
            machine.handle(event, NetworkStatus::Connected).1,
            vec![Effect::KickDrain]
        );
        let direct = LinkEvent::Payload {
            channel: ChannelId::GenericPayload,
            direct: true,
        };
        assert_eq!(
            machine.handle(direct, NetworkStatus::Connected).1,
            vec![Effect::KickDrain, Effect::PublishPending]
        );
    }

    fn any_event() -> impl Strategy<Value = LinkEvent> {
        prop_oneof![
            Just(LinkEvent::Network(NetworkStatus::Connected)),
            Just(LinkEvent::Network(NetworkStatus::Disconnected)),
            Just(LinkEvent::BrokerConnected),
            Just(LinkEvent::BrokerDisconnected),
            any::<bool>().prop_map(|direct| LinkEvent::Payload {
                channel: ChannelId::GenericPayload,
                direct
            }),
        ]
    }

    proptest! {
        #[test]
        fn connected_only_after_handshake(events in prop::collection::vec(any_event(), 0..64)) {
            let mut machine = LinkMachine::new(SETTLE, PERIOD);
            let mut network = NetworkStatus::Disconnected;
            let mut handshake_seen = false;
            for event in events {
                if let LinkEvent::Network(status) = event {
                    network = status;
                }
                if event == LinkEvent::BrokerConnected {
                    handshake_seen = true;
                }
                if event == LinkEvent::BrokerDisconnected {
                    handshake_seen = false;
                }
                machine.handle(event, network);
                if machine.state() == LinkState::Connected {
                    prop_assert!(handshake_seen);
                }
            }
        }

        #[test]
        fn at_most_one_connect_timer(events in prop::collection::vec(any_event(), 0..64)) {
            // A schedule replaces any pending deadline, so model the timer as a slot
            let mut machine = LinkMachine::new(SETTLE, PERIOD);
            let mut network = NetworkStatus::Disconnected;
            let mut timers: Vec<Duration> = Vec::new();
            for event in events {
                if let LinkEvent::Network(status) = event {
                    network = status;
                }
                let (_, effects) = machine.handle(event, network);
                for effect in effects {
                    match effect {
                        Effect::ScheduleConnect(delay) => {
                            timers.clear();
                            timers.push(delay);
                        }
                        Effect::CancelConnect => timers.clear(),
                        _ => {}
                    }
                }
                prop_assert!(timers.len() <= 1);
                if machine.state() == LinkState::Connected && event == LinkEvent::BrokerConnected {
                    prop_assert!(timers.is_empty());
                }
            }
        }

        #[test]
        fn connected_state_never_schedules(events in prop::collection::vec(any_event(), 0..64)) {
            let mut machine = LinkMachine::new(SETTLE, PERIOD);
            let mut network = NetworkStatus::Disconnected;
            for event in events {
                if let LinkEvent::Network(status) = event {
                    network = status;
                }
                let before = machine.state();
                let (_, effects) = machine.handle(event, network);
                if before == LinkState::Connected && machine.state() == LinkState::Connected {
                    prop_assert!(!effects.iter().any(|e| matches!(e, Effect::ScheduleConnect(_))));
                }
            }
        }
    }
}
