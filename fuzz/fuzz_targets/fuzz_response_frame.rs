#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use voltage_collector::codec::parse_read_payload;
use voltage_collector::{decode_register_value, ByteOrder, Framing, Protocol, RegisterType};

#[derive(Debug, Arbitrary)]
struct Input {
    tcp: bool,
    quantity: u16,
    request: Vec<u8>,
    response: Vec<u8>,
}

// Device replies are untrusted: parsing must fail cleanly, never panic.
fuzz_target!(|input: Input| {
    let protocol = if input.tcp { Protocol::Tcp } else { Protocol::Rtu };
    let framing = protocol.framing();

    let _ = framing.validate_checksum(&input.response);
    let Ok(pdu) = framing.parse_response(&input.request, &input.response) else {
        return;
    };
    let Ok(data) = parse_read_payload(pdu, 0x03, input.quantity) else {
        return;
    };

    let registers: Vec<u16> = data
        .chunks_exact(2)
        .map(|w| u16::from_be_bytes([w[0], w[1]]))
        .collect();
    for register_type in [RegisterType::Float32, RegisterType::Uint64, RegisterType::Bits] {
        let _ = decode_register_value(&registers, register_type, ByteOrder::BigEndianSwap);
    }
});
