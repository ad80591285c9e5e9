/*
┌──────────────────────────────────────────────────┐
│                 ChannelRegistry                  │
│  registrations ── observe_all() ──▶ snapshots    │
│  merged events ── subscribe()   ──▶ consumers    │
└───────────────▲──────────────────────────────────┘
                │ relay (one task per channel)
┌───────────────┴──────────────────────────────────┐
│           ChannelBridge (per channel)            │
│  IoChannelBridge: connections via the manager    │
│  PipeChannelBridge: in-process queues            │
└───────▲───────────────────────────────┬──────────┘
        │ report_* / emit_inbound       │ deliver / send_outbound
┌───────┴───────────────────────────────▼──────────┐
│              ChannelExtension (guest)            │
└──────────────────────────────────────────────────┘
*/
pub mod bridge;
pub mod error;
pub mod event;
pub mod pipe_bridge;
pub mod registration;
pub mod registry;

pub use bridge::{ChannelBridge, IoChannelBridge};
pub use error::ChannelError;
pub use event::ChannelEvent;
pub use pipe_bridge::PipeChannelBridge;
pub use registration::ChannelRegistration;
pub use registry::ChannelRegistry;
