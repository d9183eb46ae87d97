// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared utilities: mapping tokens to positions in the angle cache.

pub mod positioning;
