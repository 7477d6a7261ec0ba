//! Single Collection Cycle Example
//!
//! Runs one minutely collection against transductors reached through a
//! running relay broker and prints what was stored.
//!
//! # Register Map
//!
//! A CSV file in the register map format, e.g.
//!
//! ```text
//! register,address,size,type,group,byteorder,datamodel,active
//! voltage_a,0,2,float32,minutely,lsb,read_holding_registers,true
//! voltage_b,2,2,float32,minutely,lsb,read_holding_registers,true
//! voltage_c,4,2,float32,minutely,lsb,read_holding_registers,true
//! frequency,10,1,uint16,minutely,lsb,read_input_registers,true
//! ```
//!
//! # Running this example
//!
//! ```bash
//! MAX_MSG_SIZE=4096 BROKER_PORT=9000 cargo run --bin relay-broker &
//! MAX_MSG_SIZE=4096 BROKER_PORT=9000 \
//!     cargo run --example collect_once -- maps/tr4020.csv 10.0.0.5:1001
//! ```

use std::sync::Arc;

use voltage_collector::{
    init_logging, CollectionGroup, Collector, DeviceConfig, DeviceLimits, LogConfig, MemorySink,
    ModbusError, ModbusResult, ModelRegistry, RelayConfig,
};

const MODEL: &str = "demo-model";

fn parse_device(index: usize, address: &str) -> ModbusResult<DeviceConfig> {
    let (ip, port) = address
        .rsplit_once(':')
        .ok_or_else(|| ModbusError::configuration(format!("expected ip:port, got '{}'", address)))?;
    let port: u16 = port
        .parse()
        .map_err(|_| ModbusError::configuration(format!("invalid port in '{}'", address)))?;
    Ok(DeviceConfig::new(format!("meter-{}", index + 1), MODEL, ip, port))
}

#[tokio::main]
async fn main() -> ModbusResult<()> {
    init_logging(&LogConfig::default())?;

    let mut args = std::env::args().skip(1);
    let map_path = args
        .next()
        .ok_or_else(|| ModbusError::configuration("usage: collect_once <map.csv> <ip:port>..."))?;
    let devices = args
        .enumerate()
        .map(|(i, address)| parse_device(i, &address))
        .collect::<ModbusResult<Vec<_>>>()?;

    let registry = ModelRegistry::new();
    registry.load_csv(
        MODEL,
        &map_path,
        DeviceLimits::new().with_max_block_size(10),
    )?;

    let relay = RelayConfig::from_env()?;
    let sink = Arc::new(MemorySink::new());
    let collector = Collector::new(
        Arc::new(registry),
        Arc::new(relay.transport_client()),
        Arc::clone(&sink),
    );

    let report = collector
        .run_cycle(&devices, CollectionGroup::Minutely)
        .await;

    println!("📊 Cycle {}: {} ok, {} failed", report.group, report.succeeded(), report.failed());
    for outcome in &report.outcomes {
        match &outcome.result {
            Ok(fields) => println!("  ✅ {}: {} fields", outcome.device_id, fields),
            Err(err) => println!("  ❌ {}: {} ({})", outcome.device_id, err, err.kind()),
        }
    }

    for stored in sink.measurements().await {
        let mut fields: Vec<_> = stored.measurement.iter().collect();
        fields.sort_by(|a, b| a.0.cmp(b.0));
        println!("\n{} @ {}", stored.device_id, stored.stored_at);
        for (name, value) in fields {
            println!("  {:<16} {:>10.2}", name, value);
        }
    }

    for event in sink.events().open_events().await {
        println!(
            "\n⚠️  {} {} on phases {:?}",
            event.device_id,
            event.state,
            event.values
        );
    }
    Ok(())
}
