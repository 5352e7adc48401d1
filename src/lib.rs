// SPDX-License-Identifier: Apache-2.0

pub mod bounded_channel;
pub mod init;
pub mod receivers;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
