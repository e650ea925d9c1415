// Event consumer and decision logic
pub mod decision;
pub mod event_loop;

pub use decision::DecisionEngine;
pub use event_loop::{event_queue, Activity, EngineEvent, EventLoop, EventReceiver, EventSender};
