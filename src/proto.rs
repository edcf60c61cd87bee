//! Generated protobuf bindings for the Mumble control schema.

pub mod mumble {
    #![allow(clippy::all)]
    include!(concat!(env!("OUT_DIR"), "/mumble.rs"));
}
