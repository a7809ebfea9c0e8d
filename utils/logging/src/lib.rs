// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Process-wide logger built on the slog stack. Import `macros::*` to get
//! `trace!`/`debug!`/`info!`/`warn!`/`error!`/`crit!` bound to the global
//! logger; filtering is controlled with the usual `RUST_LOG` syntax.

use lazy_static::lazy_static;
use slog::Drain;

// The macros need to name slog through this crate
pub use slog;

/// Capacity of the asynchronous drain channel. Under a log burst (e.g. chain
/// enumeration with tracing on) messages beyond this limit are dropped rather
/// than blocking the mining tasks.
const ASYNC_CHANNEL_SIZE: usize = 2048;

lazy_static! {
    pub static ref LOGGER: slog::Logger = build_logger();
}

fn build_logger() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::new(drain).fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(ASYNC_CHANNEL_SIZE)
        .build()
        .fuse();
    slog::Logger::root(drain, slog::o!())
}

#[macro_export]
macro_rules! trace {
    ($($arg:tt)+) => { $crate::slog::trace!(&*$crate::LOGGER, $($arg)+) };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)+) => { $crate::slog::debug!(&*$crate::LOGGER, $($arg)+) };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)+) => { $crate::slog::info!(&*$crate::LOGGER, $($arg)+) };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)+) => { $crate::slog::warn!(&*$crate::LOGGER, $($arg)+) };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)+) => { $crate::slog::error!(&*$crate::LOGGER, $($arg)+) };
}

#[macro_export]
macro_rules! crit {
    ($($arg:tt)+) => { $crate::slog::crit!(&*$crate::LOGGER, $($arg)+) };
}

/// Convenience re-export of all logging macros, mirrors the way dependent
/// crates import them: `use axe_logging::macros::*;`
pub mod macros {
    pub use crate::{crit, debug, error, info, trace, warn};
}
