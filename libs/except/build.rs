// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

fn main() {
    // The registry dimensions are read through `option_env!` in `src/config.rs`
    println!("cargo:rerun-if-env-changed=LIBEXCEPT_MAX_EXCEPTIONS");
    println!("cargo:rerun-if-env-changed=LIBEXCEPT_MAX_EXCEPTION_SIZE");
    println!("cargo:rerun-if-changed=build.rs");
}
