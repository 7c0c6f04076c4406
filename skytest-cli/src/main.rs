// Copyright (c) The skytest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use color_eyre::Result;

mod dispatch;
mod output;

fn main() -> Result<()> {
    color_eyre::install()?;
    dispatch::exec()
}
