// SPDX-License-Identifier: MIT
mod client;
mod wire;

pub use client::{ActionClient, ProtocolClient, TransportError};
pub use wire::{
    actions, ActionRequest, ActionResponse, ActionStatus, InboundEvent, MediaSegmentData,
    MessageType, PostType, Segment, Sender,
};
