// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

#![no_main]
use libfuzzer_sys::fuzz_target;

use rtsp_ingest::codec::h265::nal;

fuzz_target!(|data: &[u8]| {
    let Ok((h, rbsp)) = nal::split(data) else {
        return;
    };

    match h.unit_type() {
        nal::UnitType::VpsNut => {
            let _ = nal::Vps::from_rbsp(&rbsp);
        }
        nal::UnitType::SpsNut => {
            if let Ok(sps) = nal::Sps::from_rbsp(&rbsp) {
                let _ = sps.pixel_dimensions();
            }
        }
        nal::UnitType::PpsNut => {
            let _ = nal::Pps::from_rbsp(&rbsp);
        }
        _ => {}
    }
});
