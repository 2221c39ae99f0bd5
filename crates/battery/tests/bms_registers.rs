//! Battery register bank served through the UART slave host.

#![allow(clippy::unwrap_used)] // tests use unwrap() for readable assertions

use battery::registers::{control, status, REG_CONTROL, REG_HEALTH, REG_MODULE_ID, REG_SHUTDOWN, REG_STATUS};
use battery::{
    BatteryRegisters, BatterySupervisor, BMS_MODULE_ID, BMS_SHADOW_SIZE, HealthStore,
    ShutdownType, GAUGE_ADDR,
};
use modules::{MsgType, UartSlave};
use link::encode_frame;
use platform::mocks::MockFlash;

type Slave = UartSlave<BatteryRegisters<MockFlash<256>>, BMS_SHADOW_SIZE>;

fn new_slave() -> Slave {
    let supervisor = BatterySupervisor::new(GAUGE_ADDR);
    let health = HealthStore::load(MockFlash::new());
    UartSlave::new(BatteryRegisters::new(supervisor, health))
}

/// Push one command frame and collect every response frame's payload.
fn exchange(slave: &mut Slave, payload: &[u8]) -> Vec<Vec<u8>> {
    let frame = encode_frame::<96>(payload).unwrap();
    for &b in &frame {
        slave.on_rx_byte(b);
    }
    let mut responses = Vec::new();
    // lc = 1 so the periodic change check stays quiet
    while let Some(tx) = slave.poll(1) {
        slave.on_tx_complete();
        // strip framing: decode through a fresh decoder
        let mut dec: link::FrameDecoder<96> = link::FrameDecoder::new();
        for &b in &tx {
            if let Some(Ok(p)) = dec.push(b) {
                responses.push(p.to_vec());
            }
        }
    }
    responses
}

fn read_register(slave: &mut Slave, reg: u8) -> Vec<u8> {
    let responses = exchange(slave, &[MsgType::READ, reg]);
    let data = responses
        .iter()
        .find(|p| p.first() == Some(&MsgType::READ_DATA) && p.get(1) == Some(&reg))
        .unwrap();
    data[2..].to_vec()
}

fn write_register(slave: &mut Slave, reg: u8, data: &[u8]) -> Vec<Vec<u8>> {
    let mut payload = vec![MsgType::WRITE, reg];
    payload.extend_from_slice(data);
    exchange(slave, &payload)
}

#[test]
fn module_id_reads_constant() {
    let mut slave = new_slave();
    assert_eq!(read_register(&mut slave, REG_MODULE_ID), vec![BMS_MODULE_ID]);
}

#[test]
fn health_write_persists_and_acks() {
    let mut slave = new_slave();
    let responses = write_register(&mut slave, REG_HEALTH, &0.75f32.to_le_bytes());
    // write acknowledgement event: [EVENT, WRITE_ACK, reg]
    assert!(responses
        .iter()
        .any(|p| p.as_slice() == [MsgType::EVENT, 0x01, REG_HEALTH]));
    assert_eq!(read_register(&mut slave, REG_HEALTH), 0.75f32.to_le_bytes());
}

#[test]
fn invalid_health_reports_error_event() {
    let mut slave = new_slave();
    let responses = write_register(&mut slave, REG_HEALTH, &2.0f32.to_le_bytes());
    // error event: [EVENT, ERROR, code_lo, code_hi] with the format code
    assert!(responses
        .iter()
        .any(|p| p.first() == Some(&MsgType::EVENT) && p.get(1) == Some(&0x02)));
    assert_eq!(read_register(&mut slave, REG_HEALTH), 1.0f32.to_le_bytes());
}

#[test]
fn host_shutdown_request_arms_and_cancels() {
    let mut slave = new_slave();

    write_register(&mut slave, REG_CONTROL, &[control::REQ_SHUTDOWN]);
    let shutdown = read_register(&mut slave, REG_SHUTDOWN);
    assert_eq!(shutdown[0], ShutdownType::HostRequest as u8);
    let ms = u16::from_le_bytes([shutdown[1], shutdown[2]]);
    assert!(ms > 9_000, "countdown {ms} ms");

    // status reflects the scheduled shutdown
    let st = read_register(&mut slave, REG_STATUS)[0];
    assert_ne!(st & status::SHUTDOWN, 0);

    // writing 0 cancels it
    write_register(&mut slave, REG_CONTROL, &[0]);
    let shutdown = read_register(&mut slave, REG_SHUTDOWN);
    assert_eq!(shutdown[0], ShutdownType::None as u8);
}

#[test]
fn rearming_same_shutdown_keeps_countdown() {
    let mut slave = new_slave();
    write_register(&mut slave, REG_CONTROL, &[control::REQ_SHUTDOWN]);
    let first = read_register(&mut slave, REG_SHUTDOWN);

    // re-arming the same type must not restart the countdown
    write_register(&mut slave, REG_CONTROL, &[control::REQ_SHUTDOWN]);
    let second = read_register(&mut slave, REG_SHUTDOWN);
    assert_eq!(first, second);
}

#[test]
fn bad_reset_code_is_rejected() {
    let mut slave = new_slave();
    let responses = write_register(&mut slave, REG_CONTROL, &[0x50]); // nibble 5 ≠ 0xA
    assert!(responses
        .iter()
        .any(|p| p.first() == Some(&MsgType::EVENT) && p.get(1) == Some(&0x02)));
    assert!(!slave.bank().reset_requested());
}

#[test]
fn reset_code_flags_pending_reset() {
    let mut slave = new_slave();
    write_register(&mut slave, REG_CONTROL, &[0xA0]);
    assert!(slave.bank().reset_requested());
}

#[test]
fn default_notification_mask_covers_faults_and_shutdown() {
    let slave = new_slave();
    assert_eq!(slave.notif_mask(), 0x0C00);
}
