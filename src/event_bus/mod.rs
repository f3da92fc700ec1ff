//! Event bus utilities providing fan-out, sinks, and subscriber APIs.
//!
//! The module is organised around a flume-fed [`EventBus`] whose listener
//! task forwards every event both to registered [`EventSink`]s and to
//! broadcast subscribers consuming an [`EventStream`].

pub mod bus;
pub mod event;
pub mod sink;
pub mod stream;

pub use bus::EventBus;
pub use event::{DiagnosticEvent, Event, NodeEvent, RunEvent, StepEvent, STREAM_END_SCOPE};
pub use sink::{ChannelSink, EventSink, MemorySink, StdOutSink};
pub use stream::{BlockingEventIter, EventStream};
