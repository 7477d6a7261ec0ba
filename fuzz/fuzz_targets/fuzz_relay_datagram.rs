#![no_main]

use libfuzzer_sys::fuzz_target;
use voltage_collector::{RelayEnvelope, RelayResponse};

// The broker decodes whatever arrives on its socket.
fuzz_target!(|data: &[u8]| {
    if let Ok(envelope) = RelayEnvelope::decode(data) {
        let _ = envelope.transport();
        let _ = envelope.encode(65_507);
    }
    if let Ok(response) = RelayResponse::decode(data) {
        let _ = response.into_frames();
    }
});
