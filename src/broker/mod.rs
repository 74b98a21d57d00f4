//! Extension seams: the event broker (observe/cancel/override check flow)
//! and the engine hooks bundle (notifications, downtime, status writes).
//!
//! Both traits default to doing nothing so the engine runs standalone; a
//! deployment plugs richer implementations in at construction time.

use crate::objects::{Host, Service, StateType};

/// Where in a check's lifecycle a broker callback fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckPhase {
    /// Before viability is evaluated.
    Precheck,
    /// After the command is built, before dispatch.
    Initiate,
    /// After the result ran through the state machine.
    Processed,
}

/// Broker verdict on a check event.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerVerdict {
    /// Proceed normally.
    Continue,
    /// Drop the check; the object keeps its schedule.
    Cancel,
    /// Skip execution; the broker supplies the result itself.
    Override {
        /// Substitute return code.
        return_code: i32,
        /// Substitute plugin output.
        output: String,
    },
}

/// A state change being announced to the broker.
#[derive(Debug, Clone)]
pub struct StateChangeEvent<'a> {
    /// Host name.
    pub host: &'a str,
    /// Service description; `None` for host changes.
    pub service: Option<&'a str>,
    /// Previous state code.
    pub old_state: u8,
    /// New state code.
    pub new_state: u8,
    /// Soft or hard.
    pub state_type: StateType,
    /// Attempt the change happened on.
    pub attempt: u32,
}

/// Observation and veto points around check execution.
pub trait EventBroker: Send {
    /// Host check lifecycle callback.
    fn host_check(&mut self, _phase: CheckPhase, _host: &Host) -> BrokerVerdict {
        BrokerVerdict::Continue
    }

    /// Service check lifecycle callback.
    fn service_check(&mut self, _phase: CheckPhase, _service: &Service) -> BrokerVerdict {
        BrokerVerdict::Continue
    }

    /// A soft or hard state change was recorded.
    fn state_change(&mut self, _event: &StateChangeEvent<'_>) {}
}

/// Why a notification hook fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationReason {
    /// Hard problem or hard recovery.
    Normal,
    /// Flapping started.
    FlappingStart,
    /// Flapping stopped.
    FlappingStop,
}

/// Out-of-scope subsystems the engine calls into at fixed points.
pub trait EngineHooks: Send {
    /// A host crossed a notification-worthy boundary.
    fn notify_host(&mut self, _host: &Host, _reason: NotificationReason) {}

    /// A service crossed a notification-worthy boundary.
    fn notify_service(&mut self, _service: &Service, _host: &Host, _reason: NotificationReason) {}

    /// A host entered a problem state; flexible downtimes may want to start.
    fn pending_flex_host_downtime(&mut self, _host: &Host) {}

    /// A service entered a problem state; flexible downtimes may want to
    /// start.
    fn pending_flex_service_downtime(&mut self, _service: &Service) {}

    /// Host runtime state changed in a way status consumers care about.
    fn update_host_status(&mut self, _host: &Host) {}

    /// Service runtime state changed in a way status consumers care about.
    fn update_service_status(&mut self, _service: &Service) {}
}

/// Broker that lets everything through.
#[derive(Debug, Default)]
pub struct NoopBroker;

impl EventBroker for NoopBroker {}

/// Hooks that do nothing.
#[derive(Debug, Default)]
pub struct NoopHooks;

impl EngineHooks for NoopHooks {}
