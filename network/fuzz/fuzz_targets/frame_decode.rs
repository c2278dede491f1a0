// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fuzz test for wire frame decoding
//! Feeds random bytes through the frame reader and applies any entries to a
//! log; neither step may panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use peerchat_core::{Entry, EntryLog};
use peerchat_network::protocols::wire::{read_frame, Message};

const MAX_FRAME_LEN: usize = 64 * 1024;

fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }

    let runtime = match tokio::runtime::Builder::new_current_thread().build() {
        Ok(runtime) => runtime,
        Err(_) => return,
    };
    runtime.block_on(decode_and_apply(data));
});

async fn decode_and_apply(mut data: &[u8]) {
    let log = EntryLog::new([0u8; 32]);

    // Stop at the first malformed or truncated frame
    while let Ok(Some(message)) = read_frame(&mut data, MAX_FRAME_LEN).await {
        if let Message::EntryData {
            sequence,
            role,
            content,
            digest,
        } = message
        {
            let _ = log.apply(Entry {
                sequence,
                role,
                content,
                digest,
            });
        }
    }
}
