// Copyright (C) 2022 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Length-limited hex dumps for log and error messages.

use pretty_hex::PrettyHex;

pub struct LimitedHex<'a> {
    inner: &'a [u8],
    max_bytes: usize,
}

impl<'a> LimitedHex<'a> {
    pub fn new(inner: &'a [u8], max_bytes: usize) -> Self {
        Self { inner, max_bytes }
    }
}

impl std::fmt::Debug for LimitedHex<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (print, omitted) = match self.inner.len().checked_sub(self.max_bytes) {
            Some(o) if o > 0 => (&self.inner[..self.max_bytes], o),
            _ => (self.inner, 0),
        };
        writeln!(f, "Length: {0} (0x{0:x}) bytes", self.inner.len())?;
        write!(
            f,
            "{:#?}",
            print.hex_conf(pretty_hex::HexConfig {
                title: false,
                ..Default::default()
            })
        )?;
        if omitted > 0 {
            write!(f, "\n...{omitted} (0x{omitted:x}) bytes not shown...")?;
        }
        Ok(())
    }
}
