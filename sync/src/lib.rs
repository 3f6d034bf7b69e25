// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Synchronization primitives that panic rather than returning a
//! `PoisonError`.
//!
//! The process is built with the expectation that a panic anywhere takes the
//! whole process down, so lock poisoning never needs to be handled and code
//! should not be littered with `.lock().unwrap()`. Use these types anywhere
//! `std::sync::Mutex` or `std::sync::Condvar` would otherwise appear.

mod completion;
mod condvar;
mod mutex;

pub use completion::Completion;
pub use condvar::Condvar;
pub use mutex::Mutex;
