pub mod roster;
pub mod wire;

pub use roster::{AgentDescriptor, Roster, RosterError};
pub use wire::{
    decode_inbound, BroadcastKind, BroadcastMessage, InboundFrame, MessageKind, OutboundEvent,
    Participant, WireError, DEFAULT_MAX_FRAME_BYTES,
};
