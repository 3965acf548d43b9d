// Copyright 2026 Servolink Developers
// SPDX-License-Identifier: Apache-2.0

//! Device profiles for servolink channels.
//!
//! A profile supplies everything device-generation-specific that the
//! protocol core deliberately knows nothing about: which registers exist and
//! in what order to synchronize them, how to derive the coarse device status
//! from register values, and which condition-register bits mean what.

pub mod mk2;

pub use mk2::{Mk2Profile, Mk2Registers};
