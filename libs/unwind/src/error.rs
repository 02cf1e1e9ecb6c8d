// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#[derive(Debug, onlyerror::Error)]
pub enum Error {
    /// Gimli error
    Gimli(gimli::Error),
    /// Malformed language specific data area
    MalformedLsda,
    /// Malformed unwind table
    MalformedUnwindTable,
    /// Frame refuses to be unwound
    RefuseToUnwind,
    /// Unsupported unwind opcode
    UnsupportedOpcode(u8),
    /// No unwind tables are available
    MissingTables,
    /// No unwind information for address
    NoUnwindInfo(usize),
}

impl From<gimli::Error> for Error {
    fn from(err: gimli::Error) -> Self {
        Error::Gimli(err)
    }
}
