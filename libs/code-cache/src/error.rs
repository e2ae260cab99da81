// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::WriteStrategy;

#[derive(Debug, onlyerror::Error)]
pub enum Error {
    #[error("failed to reserve {size} bytes of address space for the code cache: {err}")]
    Reserve { size: usize, err: std::io::Error },
    #[error("failed to change protection of code cache memory: {0}")]
    Protect(std::io::Error),
    #[error("failed to create a writable alias of the code cache: {0}")]
    Alias(std::io::Error),
    #[error("write strategy {0:?} is not supported on this host")]
    UnsupportedStrategy(WriteStrategy),
    #[error("code alignment {0} is not a power of two")]
    InvalidAlignment(usize),
    #[error("code cache capacity must not be zero")]
    ZeroCapacity,
}
