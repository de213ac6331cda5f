// SPDX-License-Identifier: GPL-3.0-only

//! Processing pipelines for completed frames
//!
//! # Modules
//!
//! - [`post_processing`]: Stage chain run concurrently per frame, delivered
//!   in capture order

pub mod post_processing;
