// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io;

#[derive(Debug, onlyerror::Error)]
pub enum Error {
    #[error("fault tracking is not supported on this host")]
    UnsupportedHost,
    #[error("failed to generate the fault handler: {0}")]
    CodeGen(#[from] jit_codegen::Error),
    #[error("failed to set up the code cache: {0}")]
    CodeCache(#[from] code_cache::Error),
    #[error("failed to install the fault handler: {0}")]
    Install(io::Error),
    #[error("failed to restore the previous fault handler: {0}")]
    Restore(io::Error),
}
