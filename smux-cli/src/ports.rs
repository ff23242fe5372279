//! Serial port listing

use serialport::{available_ports, SerialPortType};

pub fn print_ports() -> anyhow::Result<()> {
    let ports = available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
        return Ok(());
    }

    for port in ports {
        println!("{}", describe(&port.port_name, &port.port_type));
    }
    Ok(())
}

fn describe(name: &str, port_type: &SerialPortType) -> String {
    match port_type {
        SerialPortType::UsbPort(usb) => usb_label(
            name,
            usb.vid,
            usb.pid,
            usb.manufacturer.as_deref(),
            usb.product.as_deref(),
        ),
        SerialPortType::BluetoothPort => format!("{}  Bluetooth", name),
        SerialPortType::PciPort => format!("{}  PCI", name),
        SerialPortType::Unknown => name.to_string(),
    }
}

fn usb_label(
    name: &str,
    vid: u16,
    pid: u16,
    manufacturer: Option<&str>,
    product: Option<&str>,
) -> String {
    let product = product.unwrap_or("USB serial");
    match manufacturer {
        Some(manufacturer) => format!(
            "{}  {} ({}) [{:04X}:{:04X}]",
            name, product, manufacturer, vid, pid
        ),
        None => format!("{}  {} [{:04X}:{:04X}]", name, product, vid, pid),
    }
}
