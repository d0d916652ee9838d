//! Inbound responder over TCP against a fully simulated hub

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use hubsrv::protocols::dali::SimulatedGear;
use hubsrv::protocols::modbus::constants::*;
use hubsrv::protocols::modbus::frame;
use hubsrv::regs::DaliBank;
use hubsrv::{server, Hub, HubConfig, Responder};

struct Running {
    stream: TcpStream,
    token: CancellationToken,
}

impl Drop for Running {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn start() -> Running {
    let mut config = HubConfig::default();
    config.engine.poll_interval_us = 200;
    config.modbus.warmup_ms = 10;
    config.dali.simulate = vec![
        SimulatedGear::new(2).with_limits(20, 200).with_level(120),
        SimulatedGear::new(9),
    ];
    config.validate().unwrap();

    let (mut hub, handle) = Hub::from_config(&config, true).unwrap();
    hub.start_default_tasks(Instant::now()).unwrap();

    let token = CancellationToken::new();
    tokio::spawn(hub.run(token.clone()));

    let listener = server::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let responder = Responder::new(handle, None, config.downstream_timeout());
    tokio::spawn(server::serve(listener, responder, token.clone()));

    let stream = TcpStream::connect(addr).await.unwrap();
    Running { stream, token }
}

async fn exchange(stream: &mut TcpStream, request: &[u8], reply_len: usize) -> Vec<u8> {
    stream.write_all(request).await.unwrap();
    let mut reply = vec![0u8; reply_len];
    tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut reply))
        .await
        .expect("reply within timeout")
        .unwrap();
    reply
}

async fn read_register(stream: &mut TcpStream, reg: u16) -> u16 {
    let reply = exchange(
        stream,
        &frame::read_request(1, FC_READ_HOLDING_REGISTERS, reg, 1),
        7,
    )
    .await;
    u16::from_be_bytes([reply[3], reply[4]])
}

/// Poll a register until the scan has filled it in
async fn wait_for_register(stream: &mut TcpStream, reg: u16, absent: u16) -> u16 {
    for _ in 0..200 {
        let value = read_register(stream, reg).await;
        if value != absent {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("register {} never populated", reg);
}

#[tokio::test]
async fn scan_results_are_readable() {
    let mut hub = start().await;
    let stream = &mut hub.stream;

    assert_eq!(
        wait_for_register(stream, DaliBank::DeviceType.register(9), 0xFFFF).await,
        6
    );
    assert_eq!(read_register(stream, DaliBank::MinMax.register(2)).await, 0xC814);
    assert_eq!(read_register(stream, DaliBank::MinMax.register(3)).await, 0xFFFF);
}

#[tokio::test]
async fn coil_write_reaches_relay_board() {
    let mut hub = start().await;
    let stream = &mut hub.stream;

    let request = frame::write_single_coil(1, 5, COIL_ON);
    let reply = exchange(stream, &request, 8).await;
    assert_eq!(reply, request);

    let reply = exchange(stream, &frame::read_request(1, FC_READ_COILS, 0, 8), 6).await;
    assert_eq!(reply[2], 1);
    assert_eq!(reply[3], 0b0010_0000);
}

#[tokio::test]
async fn level_write_and_raw_query() {
    let mut hub = start().await;
    let stream = &mut hub.stream;
    wait_for_register(stream, DaliBank::DeviceType.register(9), 0xFFFF).await;

    let request = frame::write_single_register(1, DaliBank::Status.register(2), 0x0050);
    let reply = exchange(stream, &request, 8).await;
    assert_eq!(reply, request);

    // QUERY ACTUAL LEVEL straight onto the bus; the simulated fade settles
    // after a couple of status polls
    let query = frame::exec_dali(1, 0x05A0, false);
    let mut level = 0;
    for _ in 0..50 {
        let reply = exchange(stream, &query, 5).await;
        assert_eq!(reply[1], FC_EXEC_DALI);
        level = reply[2];
        if level == 0x50 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(level, 0x50);
}

#[tokio::test]
async fn missing_device_answers_negative_acknowledge() {
    let mut hub = start().await;
    let stream = &mut hub.stream;

    let request = frame::write_single_register(1, DaliBank::Status.register(30), 0x0010);
    let reply = exchange(stream, &request, 5).await;
    assert_eq!(
        reply,
        frame::exception_response(1, FC_WRITE_SINGLE_REGISTER, EX_NEGATIVE_ACKNOWLEDGE)
    );
}

#[tokio::test]
async fn corrupted_request_gets_no_answer() {
    let mut hub = start().await;
    let stream = &mut hub.stream;

    let mut bad = frame::read_request(1, FC_READ_COILS, 0, 8);
    bad[7] ^= 0xFF;
    stream.write_all(&bad).await.unwrap();
    let mut buf = [0u8; 1];
    let silent =
        tokio::time::timeout(Duration::from_millis(200), stream.read(&mut buf)).await;
    assert!(silent.is_err());

    // The connection still serves well-formed requests
    let reply = exchange(stream, &frame::read_request(1, FC_READ_COILS, 0, 8), 6).await;
    assert_eq!(reply[1], FC_READ_COILS);
}
