//! Gateway Simulator
//!
//! Simulates two LoRa gateways hearing the same uplink and forwarding it
//! over the Semtech UDP Packet Forwarder protocol. The uplink carries a
//! LinkCheckReq, so the server should answer with a PULL_RESP to the
//! gateway with the better SNR.
//!
//! Usage: cargo run --bin gateway-sim [server_addr]

use base64::Engine;
use std::env;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Duration};

const PROTOCOL_VERSION: u8 = 0x02;
const PUSH_DATA: u8 = 0x00;
const PULL_DATA: u8 = 0x02;
const PULL_RESP: u8 = 0x03;
const TX_ACK: u8 = 0x05;

/// Simulated gateways with the SNR and RSSI each reports for the uplink
const GATEWAYS: [([u8; 8], f32, i32); 2] = [
    ([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x00, 0x01], 3.5, -98),
    ([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x00, 0x02], 7.0, -74),
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let server_addr: SocketAddr = env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:1700".to_string())
        .parse()?;

    println!("Gateway Simulator");
    println!("  Target: {}", server_addr);
    println!();

    let mut sockets = Vec::new();
    for (eui, _, _) in &GATEWAYS {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket
            .send_to(&header(1, PULL_DATA, eui), server_addr)
            .await?;
        expect_ack(&socket, "PULL_ACK").await;
        sockets.push(socket);
    }

    // DevAddr 260B1234, ADR set, FCnt 1, FOpts = LinkCheckReq
    let phy: Vec<u8> = vec![
        0x40, 0x34, 0x12, 0x0B, 0x26, 0x81, 0x01, 0x00, 0x02, 0x78, 0x56, 0x34, 0x12,
    ];
    let data = base64::engine::general_purpose::STANDARD.encode(&phy);

    for (i, ((eui, lsnr, rssi), socket)) in GATEWAYS.iter().zip(&sockets).enumerate() {
        let json = serde_json::json!({
            "rxpk": [{
                "tmst": 3_512_348_611u32,
                "rfch": 0,
                "freq": 868.1,
                "modu": "LORA",
                "datr": "SF7BW125",
                "codr": "4/5",
                "lsnr": lsnr,
                "rssi": rssi,
                "size": phy.len(),
                "data": data,
            }]
        });

        let mut packet = header(10 + i as u16, PUSH_DATA, eui);
        packet.extend_from_slice(json.to_string().as_bytes());

        println!("Gateway {} sends uplink (lsnr {}, rssi {})", hex::encode(eui), lsnr, rssi);
        socket.send_to(&packet, server_addr).await?;
        expect_ack(socket, "PUSH_ACK").await;
    }

    println!();
    println!("Waiting for downlink...");

    let waits = sockets.iter().zip(&GATEWAYS).map(|(socket, (eui, _, _))| async move {
        let mut buf = [0u8; 1024];
        match timeout(Duration::from_secs(3), socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) if len >= 4 && buf[3] == PULL_RESP => {
                let json = String::from_utf8_lossy(&buf[4..len]);
                println!("  PULL_RESP for {}: {}", hex::encode(eui), json);

                let mut ack = header(0, TX_ACK, eui);
                ack[1] = buf[1];
                ack[2] = buf[2];
                let _ = socket.send_to(&ack, from).await;
            }
            Ok(Ok((len, _))) => println!("  Unexpected response ({} bytes)", len),
            Ok(Err(e)) => println!("  Recv error: {}", e),
            Err(_) => println!("  No downlink for {}", hex::encode(eui)),
        }
    });
    for wait in waits {
        wait.await;
    }

    println!();
    println!("Simulation complete");
    Ok(())
}

fn header(token: u16, packet_type: u8, gateway_eui: &[u8; 8]) -> Vec<u8> {
    let mut packet = vec![PROTOCOL_VERSION];
    packet.extend_from_slice(&token.to_be_bytes());
    packet.push(packet_type);
    packet.extend_from_slice(gateway_eui);
    packet
}

async fn expect_ack(socket: &UdpSocket, what: &str) {
    let mut buf = [0u8; 64];
    match timeout(Duration::from_secs(2), socket.recv_from(&mut buf)).await {
        Ok(Ok((len, from))) if len >= 4 => println!("  {} from {}", what, from),
        Ok(Ok((len, from))) => println!("  Unexpected response ({} bytes) from {}", len, from),
        Ok(Err(e)) => println!("  Recv error: {}", e),
        Err(_) => println!("  No {} (timeout)", what),
    }
}
