use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Readiness, ServiceState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    StartRequested,
    Launched,
    LaunchFailed,
    HealthPassed,
    Crashed,
    StopCompleted,
    Aborted,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid state transition from {from} with event {event:?}")]
pub struct InvalidTransition {
    pub from: ServiceState,
    pub event: LifecycleEvent,
}

pub struct HandlerStateMachine;

impl HandlerStateMachine {
    pub fn transition(
        state: ServiceState,
        event: LifecycleEvent,
    ) -> Result<ServiceState, InvalidTransition> {
        use LifecycleEvent as E;
        use ServiceState as S;

        let next = match (state, event) {
            (S::Uninitialized | S::Stopped | S::Failed, E::StartRequested) => S::Starting,
            (S::Starting, E::Launched) => S::Running(Readiness::Unverified),
            (S::Starting, E::LaunchFailed) => S::Failed,

            (S::Running(_), E::HealthPassed) => S::Running(Readiness::Healthy),

            (S::Starting | S::Running(_), E::Crashed) => S::Failed,

            (S::Starting | S::Running(_) | S::Failed | S::Stopped, E::StopCompleted) => S::Stopped,
            (S::Uninitialized, E::StopCompleted) => S::Uninitialized,

            (S::Uninitialized | S::Starting | S::Running(_) | S::Failed, E::Aborted) => S::Failed,

            (from, event) => return Err(InvalidTransition { from, event }),
        };

        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNVERIFIED: ServiceState = ServiceState::Running(Readiness::Unverified);
    const HEALTHY: ServiceState = ServiceState::Running(Readiness::Healthy);

    #[test]
    fn test_happy_path() {
        let mut state = ServiceState::Uninitialized;
        for (event, expected) in [
            (LifecycleEvent::StartRequested, ServiceState::Starting),
            (LifecycleEvent::Launched, UNVERIFIED),
            (LifecycleEvent::HealthPassed, HEALTHY),
            (LifecycleEvent::StopCompleted, ServiceState::Stopped),
        ] {
            state = HandlerStateMachine::transition(state, event).unwrap();
            assert_eq!(state, expected);
        }
    }

    #[test]
    fn test_repeated_health_is_idempotent() {
        let state = HandlerStateMachine::transition(HEALTHY, LifecycleEvent::HealthPassed);
        assert_eq!(state, Ok(HEALTHY));
    }

    #[test]
    fn test_crash_fails_running_handler() {
        for from in [UNVERIFIED, HEALTHY, ServiceState::Starting] {
            assert_eq!(
                HandlerStateMachine::transition(from, LifecycleEvent::Crashed),
                Ok(ServiceState::Failed)
            );
        }
    }

    #[test]
    fn test_launch_failure() {
        assert_eq!(
            HandlerStateMachine::transition(ServiceState::Starting, LifecycleEvent::LaunchFailed),
            Ok(ServiceState::Failed)
        );
    }

    #[test]
    fn test_stop_is_idempotent() {
        assert_eq!(
            HandlerStateMachine::transition(ServiceState::Stopped, LifecycleEvent::StopCompleted),
            Ok(ServiceState::Stopped)
        );
        assert_eq!(
            HandlerStateMachine::transition(
                ServiceState::Uninitialized,
                LifecycleEvent::StopCompleted
            ),
            Ok(ServiceState::Uninitialized)
        );
    }

    #[test]
    fn test_restart_after_stop_or_failure() {
        for from in [ServiceState::Stopped, ServiceState::Failed] {
            assert_eq!(
                HandlerStateMachine::transition(from, LifecycleEvent::StartRequested),
                Ok(ServiceState::Starting)
            );
        }
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(HandlerStateMachine::transition(UNVERIFIED, LifecycleEvent::StartRequested).is_err());
        assert!(
            HandlerStateMachine::transition(ServiceState::Stopped, LifecycleEvent::HealthPassed)
                .is_err()
        );
        assert!(
            HandlerStateMachine::transition(ServiceState::Stopped, LifecycleEvent::Crashed).is_err()
        );

        let err = HandlerStateMachine::transition(ServiceState::Stopped, LifecycleEvent::Aborted)
            .unwrap_err();
        assert_eq!(err.from, ServiceState::Stopped);
        assert!(err.to_string().contains("Stopped"));
    }
}
