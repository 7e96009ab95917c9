//! Wire format for the hardware wallet simulator protocol.
//!
//! Message bodies are protobuf (prost) messages. Each body travels inside a
//! one-byte frame header: the message type on requests and the response code
//! on responses (see [`frame`]).

#![forbid(unsafe_code)]

pub mod frame;
pub mod validation;

#[cfg(test)]
mod proptests;

/// Version 1 message bodies, generated from `proto/hwsim_v1.proto`.
pub mod v1 {
    include!(concat!(env!("OUT_DIR"), "/hwsim.v1.rs"));
}
