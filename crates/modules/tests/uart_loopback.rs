//! Master ↔ slave loopback over an in-memory UART link.

#![allow(clippy::unwrap_used)] // tests use unwrap() for readable assertions

use modules::init::InitStatus;
use modules::{
    total_size, ErrorCode, InitPlan, ModuleEvent, ModuleInit, NotifyingBank, ReadAccess, ReadKind,
    RegisterBank, RegisterLayout, UartMaster, UartSlave, WriteOutcome,
};

// ---------------------------------------------------------------------------
// Toy module: a handful of registers covering the interesting width classes
// ---------------------------------------------------------------------------

const REG_STATUS: u8 = 0x01;
const REG_VALUE: u8 = 0x02;
const REG_LEVEL: u8 = 0x03;
const REG_NAME: u8 = 0x10;
const REG_NOTIF_MASK: u8 = 0x20;
const REG_CONTROL: u8 = 0x30;
const REG_MODULE_ID: u8 = 0xFE;

const MODULE_ID: u8 = 0x77;

const fn widths() -> [u8; 256] {
    let mut w = [0u8; 256];
    w[REG_STATUS as usize] = 1;
    w[REG_VALUE as usize] = 2;
    w[REG_LEVEL as usize] = 4;
    w[REG_NAME as usize] = 16;
    w[REG_NOTIF_MASK as usize] = 2;
    w[REG_CONTROL as usize] = 1;
    w[REG_MODULE_ID as usize] = 1;
    w
}
static WIDTHS: [u8; 256] = widths();
const SHADOW_SIZE: usize = total_size(&WIDTHS);

#[derive(Default)]
struct ToyBank {
    fault: bool,
    value: u16,
    level: f32,
    name: &'static str,
    control: u8,
    status_reads: u32,
}

impl RegisterBank for ToyBank {
    fn layout(&self) -> RegisterLayout {
        RegisterLayout::new(&WIDTHS)
    }

    fn read(
        &mut self,
        addr: u8,
        out: &mut [u8],
        access: ReadAccess<'_>,
    ) -> Result<usize, ErrorCode> {
        match addr {
            REG_STATUS => {
                let mut status = u8::from(self.fault);
                if access.kind == ReadKind::Host {
                    self.status_reads += 1;
                    if *access.link_error {
                        status |= 0x80;
                        *access.link_error = false;
                    }
                }
                out[0] = status;
                Ok(1)
            }
            REG_VALUE => {
                out.copy_from_slice(&self.value.to_le_bytes());
                Ok(2)
            }
            REG_LEVEL => {
                out.copy_from_slice(&self.level.to_le_bytes());
                Ok(4)
            }
            REG_NAME => {
                let bytes = self.name.as_bytes();
                let n = bytes.len().min(out.len() - 1);
                out[..n].copy_from_slice(&bytes[..n]);
                out[n] = 0;
                Ok(n + 1)
            }
            REG_CONTROL => {
                out[0] = self.control;
                Ok(1)
            }
            REG_MODULE_ID => {
                out[0] = MODULE_ID;
                Ok(1)
            }
            _ => Err(ErrorCode::UART_FORMAT),
        }
    }

    fn write(&mut self, addr: u8, data: &[u8]) -> Result<WriteOutcome, ErrorCode> {
        match addr {
            REG_VALUE if data.len() == 2 => {
                self.value = u16::from_le_bytes([data[0], data[1]]);
                Ok(WriteOutcome::Accepted)
            }
            REG_CONTROL if data.len() == 1 => {
                if data[0] == 0xEE {
                    return Err(ErrorCode::COMMAND_NOT_ALLOWED);
                }
                self.control = data[0];
                Ok(WriteOutcome::Accepted)
            }
            _ => Err(ErrorCode::UART_FORMAT),
        }
    }

}

impl NotifyingBank for ToyBank {
    fn notified_registers(&self) -> &'static [u8] {
        &[REG_STATUS, REG_VALUE, REG_LEVEL]
    }

    fn notif_mask_addr(&self) -> u8 {
        REG_NOTIF_MASK
    }

    fn notif_mask_allowed(&self) -> u32 {
        0x0FFF
    }

    fn default_notif_mask(&self) -> u32 {
        1 << REG_STATUS
    }

    fn differs(&self, addr: u8, last: &[u8], current: &[u8]) -> bool {
        match addr {
            // status: only the any-fault group matters, not the exact bits
            REG_STATUS => (last.first().copied().unwrap_or(0) != 0)
                != (current.first().copied().unwrap_or(0) != 0),
            // floats: NaN-aware equality
            REG_LEVEL => {
                let f = |b: &[u8]| {
                    f32::from_le_bytes([
                        b.first().copied().unwrap_or(0),
                        b.get(1).copied().unwrap_or(0),
                        b.get(2).copied().unwrap_or(0),
                        b.get(3).copied().unwrap_or(0),
                    ])
                };
                let (a, b) = (f(last), f(current));
                !(a == b || (a.is_nan() && b.is_nan()))
            }
            _ => last != current,
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory wire
// ---------------------------------------------------------------------------

type Master = UartMaster<SHADOW_SIZE, 8>;
type Slave = UartSlave<ToyBank, SHADOW_SIZE>;

/// Run `cycles` main-loop cycles with a perfect wire in both directions.
fn pump(master: &mut Master, slave: &mut Slave, loop_count: &mut u32, cycles: u32) {
    for _ in 0..cycles {
        master.poll();
        while let Some(frame) = master.take_tx() {
            for &b in &frame {
                slave.on_rx_byte(b);
            }
        }
        while let Some(frame) = slave.poll(*loop_count) {
            slave.on_tx_complete();
            for &b in &frame {
                master.on_rx_byte(b);
            }
        }
        *loop_count += 1;
    }
}

fn new_pair() -> (Master, Slave) {
    let master = UartMaster::new(RegisterLayout::new(&WIDTHS));
    let slave = UartSlave::new(ToyBank {
        name: "toy",
        level: 1.0,
        ..ToyBank::default()
    });
    (master, slave)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn write_then_read_returns_written_value() {
    let (mut master, mut slave) = new_pair();
    let mut lc = 1;

    let wr = master.write_register(REG_VALUE, &0xBEEF_u16.to_le_bytes()).unwrap();
    let rd = master.read_register(REG_VALUE).unwrap();
    pump(&mut master, &mut slave, &mut lc, 5);

    let c1 = master.next_completion().unwrap();
    assert_eq!((c1.token, c1.ok), (wr, true));
    let c2 = master.next_completion().unwrap();
    assert_eq!((c2.token, c2.ok, c2.value, c2.width), (rd, true, 0xBEEF, 2));
    assert_eq!(master.shadow().reg16(REG_VALUE), 0xBEEF);
}

#[test]
fn string_register_reads_short_and_clears_stale() {
    let (mut master, mut slave) = new_pair();
    let mut lc = 1;

    master.read_register(REG_NAME).unwrap();
    pump(&mut master, &mut slave, &mut lc, 5);
    assert_eq!(&master.shadow().bytes(REG_NAME)[..4], b"toy\0");
}

#[test]
fn not_allowed_write_fails_without_retry() {
    let (mut master, mut slave) = new_pair();
    let mut lc = 1;

    let token = master.write_register(REG_CONTROL, &[0xEE]).unwrap();
    pump(&mut master, &mut slave, &mut lc, 5);

    let c = master.next_completion().unwrap();
    assert_eq!((c.token, c.ok), (token, false));
    assert_eq!(c.error, Some(ErrorCode::COMMAND_NOT_ALLOWED));
    // exactly one error event surfaced, no retries happened
    assert!(matches!(
        master.next_event(),
        Some(ModuleEvent::RemoteError(ErrorCode::COMMAND_NOT_ALLOWED))
    ));
    assert_eq!(master.next_event(), None);
}

#[test]
fn lost_response_is_retried_until_budget_exhausted() {
    let (mut master, mut slave) = new_pair();

    let token = master.read_register(REG_VALUE).unwrap();
    // wire drops every master frame: the slave never sees the request
    let mut sent = 0;
    for _ in 0..(4 * 501 + 10) {
        master.poll();
        while master.take_tx().is_some() {
            sent += 1;
        }
        let _ = slave.poll(1);
        slave.on_tx_complete();
    }
    // initial attempt + 3 retries
    assert_eq!(sent, 4);
    let c = master.next_completion().unwrap();
    assert_eq!((c.token, c.ok), (token, false));
}

#[test]
fn change_notification_fires_for_masked_register_only() {
    let (mut master, mut slave) = new_pair();
    let mut lc = 1;

    // enable notifications for VALUE as well as the default STATUS
    let mask = (1u16 << REG_STATUS) | (1u16 << REG_VALUE);
    master.write_register(REG_NOTIF_MASK, &mask.to_le_bytes()).unwrap();
    pump(&mut master, &mut slave, &mut lc, 5);
    while master.next_event().is_some() {}

    // first check snapshots the current state; mutate afterwards
    slave.force_change_check();
    pump(&mut master, &mut slave, &mut lc, 2);
    while master.next_event().is_some() {}

    slave.bank_mut().value = 0x1234;
    slave.bank_mut().level = 2.0; // not masked: must stay silent
    slave.force_change_check();
    pump(&mut master, &mut slave, &mut lc, 2);

    assert_eq!(master.next_event(), Some(ModuleEvent::RegisterChanged(REG_VALUE)));
    assert_eq!(master.next_event(), None);
    assert_eq!(master.shadow().reg16(REG_VALUE), 0x1234);
}

#[test]
fn status_group_diff_ignores_bit_level_changes() {
    let (mut master, mut slave) = new_pair();
    let mut lc = 1;

    slave.force_change_check();
    pump(&mut master, &mut slave, &mut lc, 2);
    while master.next_event().is_some() {}

    // fault appears: notify (0 → nonzero group change)
    slave.bank_mut().fault = true;
    slave.force_change_check();
    pump(&mut master, &mut slave, &mut lc, 2);
    assert_eq!(master.next_event(), Some(ModuleEvent::RegisterChanged(REG_STATUS)));

    // fault stays present: no second notification
    slave.force_change_check();
    pump(&mut master, &mut slave, &mut lc, 2);
    assert_eq!(master.next_event(), None);
}

#[test]
fn link_error_bit_is_clear_on_read() {
    let (mut master, mut slave) = new_pair();
    let mut lc = 1;

    // corrupt garbage on the slave's rx side raises a format error event
    for &b in &[0xF1u8, 0xFF, 0x42, 0xFA] {
        slave.on_rx_byte(b);
    }
    pump(&mut master, &mut slave, &mut lc, 3);
    assert!(matches!(
        master.next_event(),
        Some(ModuleEvent::RemoteError(ErrorCode::UART_FORMAT))
    ));

    master.read_register(REG_STATUS).unwrap();
    pump(&mut master, &mut slave, &mut lc, 3);
    assert_eq!(master.shadow().reg8(REG_STATUS) & 0x80, 0x80);

    // sticky bit consumed by the first read
    master.read_register(REG_STATUS).unwrap();
    pump(&mut master, &mut slave, &mut lc, 3);
    assert_eq!(master.shadow().reg8(REG_STATUS) & 0x80, 0x00);
}

#[test]
fn mcu_reset_event_restores_default_mask_and_reaches_master() {
    let (mut master, mut slave) = new_pair();
    let mut lc = 1;

    let mask = 0x000Eu16;
    master.write_register(REG_NOTIF_MASK, &mask.to_le_bytes()).unwrap();
    pump(&mut master, &mut slave, &mut lc, 5);
    assert_eq!(slave.notif_mask(), u32::from(mask) & 0x0FFF);

    slave.announce_mcu_reset();
    pump(&mut master, &mut slave, &mut lc, 2);
    assert_eq!(slave.notif_mask(), 1 << REG_STATUS);
    assert!(matches!(master.next_event(), Some(ModuleEvent::ModuleReset)));
}

#[test]
fn init_sequence_verifies_id_and_prefetches_shadow() {
    let (mut master, mut slave) = new_pair();
    let mut lc = 1;
    slave.bank_mut().value = 0x00AA;

    static PLAN: InitPlan = InitPlan {
        module_id_addr: REG_MODULE_ID,
        expected_id: MODULE_ID,
        enable_writes: &[(REG_CONTROL, &[0x01])],
        ready: None,
        prefetch: &[REG_VALUE, REG_NAME],
        timeout: 400,
    };
    let mut init = ModuleInit::new(PLAN);
    init.start(&mut master);

    let mut status = InitStatus::InProgress;
    for _ in 0..100 {
        pump(&mut master, &mut slave, &mut lc, 1);
        status = init.poll(&mut master);
        if status != InitStatus::InProgress {
            break;
        }
    }
    assert_eq!(status, InitStatus::Done);
    assert_eq!(slave.bank().control, 0x01);
    assert_eq!(master.shadow().reg16(REG_VALUE), 0x00AA);
    assert_eq!(&master.shadow().bytes(REG_NAME)[..4], b"toy\0");
}

#[test]
fn init_fails_on_wrong_module_id() {
    // a bank lying about its identity
    struct WrongId(ToyBank);
    impl RegisterBank for WrongId {
        fn layout(&self) -> RegisterLayout {
            self.0.layout()
        }
        fn read(
            &mut self,
            addr: u8,
            out: &mut [u8],
            access: ReadAccess<'_>,
        ) -> Result<usize, ErrorCode> {
            let n = self.0.read(addr, out, access)?;
            if addr == REG_MODULE_ID {
                out[0] = 0x12;
            }
            Ok(n)
        }
        fn write(&mut self, addr: u8, data: &[u8]) -> Result<WriteOutcome, ErrorCode> {
            self.0.write(addr, data)
        }
    }
    impl NotifyingBank for WrongId {
        fn notified_registers(&self) -> &'static [u8] {
            self.0.notified_registers()
        }
        fn notif_mask_addr(&self) -> u8 {
            self.0.notif_mask_addr()
        }
        fn notif_mask_allowed(&self) -> u32 {
            self.0.notif_mask_allowed()
        }
        fn default_notif_mask(&self) -> u32 {
            self.0.default_notif_mask()
        }
    }

    let mut master: Master = UartMaster::new(RegisterLayout::new(&WIDTHS));
    let mut slave: UartSlave<WrongId, SHADOW_SIZE> = UartSlave::new(WrongId(ToyBank::default()));

    static PLAN: InitPlan = InitPlan {
        module_id_addr: REG_MODULE_ID,
        expected_id: MODULE_ID,
        enable_writes: &[],
        ready: None,
        prefetch: &[],
        timeout: 400,
    };
    let mut init = ModuleInit::new(PLAN);
    init.start(&mut master);

    let mut lc = 1;
    let mut status = InitStatus::InProgress;
    for _ in 0..100 {
        master.poll();
        while let Some(frame) = master.take_tx() {
            for &b in &frame {
                slave.on_rx_byte(b);
            }
        }
        while let Some(frame) = slave.poll(lc) {
            slave.on_tx_complete();
            for &b in &frame {
                master.on_rx_byte(b);
            }
        }
        lc += 1;
        status = init.poll(&mut master);
        if status != InitStatus::InProgress {
            break;
        }
    }
    assert_eq!(status, InitStatus::Failed);
}
