// device_state.rs - minimal ADS round trip against a real device
// =========================================================================
//
// Reads device info and the current ADS state, then watches a PLC variable
// through a device notification for a few seconds.
//
// Usage:
//   cargo run --example device_state -- <device-ip> <ams-net-id>
//   cargo run --example device_state -- 192.168.0.231 5.24.37.144.1.1

use rust_ads::{ads_state, ports, AdsNotificationAttrib, AmsAddr, AmsRouter};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let ip = args.next().expect("device IP expected as first argument");
    let net_id = args
        .next()
        .expect("AmsNetId expected as second argument")
        .parse()?;

    let ads = AmsRouter::new();
    let port = ads.open_port()?;
    ads.add_route(net_id, ip.parse()?).await?;
    println!("local address: {}", ads.get_local_address(port)?);

    let system = AmsAddr::new(net_id, ports::SYSTEM_SERVICE);
    let (name, version) = ads.read_device_info(port, &system).await?;
    println!("device: {} {}", name, version);

    let plc = AmsAddr::new(net_id, ports::PLC_RUNTIME);
    let (state, dev_state) = ads.read_state(port, &plc).await?;
    match state {
        ads_state::RUN => println!("PLC is running (device state {})", dev_state),
        ads_state::STOP => println!("PLC is stopped (device state {})", dev_state),
        other => println!("PLC state {} (device state {})", other, dev_state),
    }

    // Watch the first DWORD of the PLC memory area for changes.
    let attrib = AdsNotificationAttrib::server_on_change(4, 10_000);
    let handle = ads
        .add_notification(
            port,
            &plc,
            0x4020,
            0,
            &attrib,
            |source, header, data, _| {
                println!("{}: {:02X?} at {}", source, data, header.timestamp);
            },
            0,
        )
        .await?;
    println!("watching 0x4020:0 via handle {:#x}, ctrl-c to stop early", handle);

    tokio::time::sleep(Duration::from_secs(5)).await;
    ads.del_notification(port, &plc, handle).await?;
    ads.close_port(port).await?;
    Ok(())
}
