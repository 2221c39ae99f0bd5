//! Master-side module client over interrupt-driven, CRC-protected I²C.
//!
//! The slave answers to a 7-bit address; a transaction writes the register
//! address and either continues with data bytes (write) or repeated-starts
//! into a read. With CRC enabled every register's data is followed by one
//! CRC-8 byte; the first register's CRC pre-image includes the bus address
//! and direction bytes, chained sequential registers restart the CRC over
//! their data bytes only.
//!
//! Transactions are executed from the main loop (one queued transfer per
//! poll); the open-drain interrupt line is latched by the ISR and serviced
//! here by reading and clearing the module's interrupt-flag register.

use embedded_hal::i2c::I2c;
use heapless::{Deque, Vec};
use link::crc::crc8;

use crate::protocol::ModuleEvent;
use crate::regmap::{RegisterLayout, RegisterShadow, MAX_REG_WIDTH};
use crate::transfer::{
    Completion, Direction, EnqueueError, Token, TransferQueue, TRANSFER_DATA_MAX,
};

/// Raw I²C transaction buffer, sized for the largest sequential run (a full
/// 32-register monitor block with one CRC byte per register).
const BUS_BUF: usize = 32 * 5 + 1;

/// I²C master client for one remote module.
pub struct I2cMaster<const SIZE: usize, const DEPTH: usize> {
    shadow: RegisterShadow<SIZE>,
    queue: TransferQueue<DEPTH>,
    completions: Deque<Completion, DEPTH>,
    events: Deque<ModuleEvent, 16>,
    address: u8,
    crc_enabled: bool,
    int_flags_addr: u8,
    int_pending: bool,
}

impl<const SIZE: usize, const DEPTH: usize> I2cMaster<SIZE, DEPTH> {
    /// Create a client.
    ///
    /// `address` is the 7-bit bus address; `int_flags_addr` the module's
    /// interrupt-flag register serviced on interrupt-line assertion.
    #[must_use]
    pub fn new(layout: RegisterLayout, address: u8, int_flags_addr: u8, crc_enabled: bool) -> Self {
        Self {
            shadow: RegisterShadow::new(layout),
            queue: TransferQueue::new(),
            completions: Deque::new(),
            events: Deque::new(),
            address,
            crc_enabled,
            int_flags_addr,
            int_pending: false,
        }
    }

    /// Local shadow of the remote register map.
    #[must_use]
    pub fn shadow(&self) -> &RegisterShadow<SIZE> {
        &self.shadow
    }

    /// Queue a read of `count` sequential registers starting at `addr`.
    ///
    /// # Errors
    ///
    /// [`EnqueueError::BadAccess`] when any register in the run is invalid,
    /// [`EnqueueError::QueueFull`] when the queue is saturated.
    pub fn read_registers(&mut self, addr: u8, count: u8) -> Result<Token, EnqueueError> {
        if count == 0 || !self.run_is_valid(addr, count) {
            return Err(EnqueueError::BadAccess);
        }
        self.queue.enqueue(Direction::Read, addr, count, Vec::new())
    }

    /// Queue a read of a single register.
    ///
    /// # Errors
    ///
    /// See [`I2cMaster::read_registers`].
    pub fn read_register(&mut self, addr: u8) -> Result<Token, EnqueueError> {
        self.read_registers(addr, 1)
    }

    /// Queue a write of `data` across `count` sequential registers starting
    /// at `addr`; `data` is the concatenation of the register payloads.
    ///
    /// # Errors
    ///
    /// See [`I2cMaster::read_registers`]; additionally the data length must
    /// match the summed register widths.
    pub fn write_registers(
        &mut self,
        addr: u8,
        count: u8,
        data: &[u8],
    ) -> Result<Token, EnqueueError> {
        if count == 0 || self.run_width(addr, count) != Some(data.len()) {
            return Err(EnqueueError::BadAccess);
        }
        let mut payload: Vec<u8, TRANSFER_DATA_MAX> = Vec::new();
        payload
            .extend_from_slice(data)
            .map_err(|_| EnqueueError::BadAccess)?;
        self.queue.enqueue(Direction::Write, addr, count, payload)
    }

    /// Queue a write of a single register.
    ///
    /// # Errors
    ///
    /// See [`I2cMaster::write_registers`].
    pub fn write_register(&mut self, addr: u8, data: &[u8]) -> Result<Token, EnqueueError> {
        self.write_registers(addr, 1, data)
    }

    /// Pop the next transfer completion.
    pub fn next_completion(&mut self) -> Option<Completion> {
        self.completions.pop_front()
    }

    /// Pop the next module event.
    pub fn next_event(&mut self) -> Option<ModuleEvent> {
        self.events.pop_front()
    }

    /// Note a falling edge (assertion) of the module interrupt line.
    ///
    /// ISR-safe: only sets a flag; the bus work happens in [`I2cMaster::poll`].
    pub fn on_interrupt_edge(&mut self) {
        self.int_pending = true;
    }

    /// Drop all pending work (used when re-initialising after a reset).
    pub fn abort_all(&mut self) {
        self.queue.clear();
    }

    /// Per-cycle update: service the interrupt line, then run at most one
    /// queued transfer on the bus.
    pub fn poll<B: I2c>(&mut self, bus: &mut B) {
        if self.int_pending {
            self.int_pending = false;
            self.service_interrupt(bus);
        }

        if self.queue.start_next().is_none() {
            return;
        }
        let (dir, addr, count) = {
            // copy out what the bus op needs; the queue entry stays in flight
            let t = self.queue.in_flight().map(|t| (t.dir, t.addr, t.count));
            match t {
                Some(parts) => parts,
                None => return,
            }
        };

        let result = match dir {
            Direction::Read => self.bus_read(bus, addr, count),
            Direction::Write => {
                let data: Vec<u8, TRANSFER_DATA_MAX> = self
                    .queue
                    .in_flight()
                    .map(|t| t.data.clone())
                    .unwrap_or_default();
                self.bus_write(bus, addr, count, &data)
            }
        };

        match result {
            Ok(first_reg) => {
                if let Some(done) = self.queue.finish() {
                    let completion =
                        Completion::success(done.token, le_value(&first_reg), first_reg.len());
                    self.push_completion(completion);
                }
            }
            Err(()) => {
                if let Some(failed) = self.queue.fail(true) {
                    self.push_completion(Completion::failure(failed.token, None));
                }
            }
        }
    }

    /// Read and clear the remote interrupt flags.
    fn service_interrupt(&mut self, bus: &mut impl I2c) {
        match self.bus_read(bus, self.int_flags_addr, 1) {
            Ok(data) => {
                let flags = data.first().copied().unwrap_or(0);
                if flags != 0 {
                    // clear the flags we saw (write-0-to-clear), keep newer ones
                    let _ = self.bus_write(bus, self.int_flags_addr, 1, &[!flags]);
                    self.push_event(ModuleEvent::Interrupt(flags));
                }
            }
            Err(()) => {
                // leave the latch cleared; a still-asserted line re-raises it
            }
        }
    }

    fn run_width(&self, addr: u8, count: u8) -> Option<usize> {
        let layout = self.shadow.layout();
        let mut total = 0usize;
        for i in 0..count {
            let a = addr.checked_add(i)?;
            let w = layout.width(a);
            if w == 0 {
                return None;
            }
            total += w;
        }
        Some(total)
    }

    fn run_is_valid(&self, addr: u8, count: u8) -> bool {
        self.run_width(addr, count).is_some()
    }

    /// Read `count` sequential registers; updates the shadow and returns the
    /// first register's data.
    fn bus_read<B: I2c>(
        &mut self,
        bus: &mut B,
        addr: u8,
        count: u8,
    ) -> Result<Vec<u8, MAX_REG_WIDTH>, ()> {
        let total = self.run_width(addr, count).ok_or(())?;
        let crc_extra = if self.crc_enabled { usize::from(count) } else { 0 };
        let mut raw: Vec<u8, BUS_BUF> = Vec::new();
        raw.resize_default(total + crc_extra).map_err(|_| ())?;

        bus.write_read(self.address, &[addr], &mut raw)
            .map_err(|_| ())?;

        let addr_w = self.address << 1;
        let addr_r = addr_w | 0x01;
        let layout = self.shadow.layout();

        let mut first: Vec<u8, MAX_REG_WIDTH> = Vec::new();
        let mut pos = 0usize;
        for i in 0..count {
            let reg = addr.wrapping_add(i);
            let width = layout.width(reg);
            let data = &raw[pos..pos + width];
            pos += width;
            if self.crc_enabled {
                let mut crc = if i == 0 {
                    crc8(0, &[addr_w, addr, addr_r])
                } else {
                    0
                };
                crc = crc8(crc, data);
                if crc != raw[pos] {
                    return Err(());
                }
                pos += 1;
            }
            if i == 0 {
                first.extend_from_slice(data).map_err(|_| ())?;
            }
            self.shadow.store(reg, data);
        }
        Ok(first)
    }

    /// Write `data` across `count` sequential registers.
    fn bus_write<B: I2c>(
        &mut self,
        bus: &mut B,
        addr: u8,
        count: u8,
        data: &[u8],
    ) -> Result<Vec<u8, MAX_REG_WIDTH>, ()> {
        let mut raw: Vec<u8, BUS_BUF> = Vec::new();
        raw.push(addr).map_err(|_| ())?;

        let addr_w = self.address << 1;
        let layout = self.shadow.layout();
        let mut pos = 0usize;
        for i in 0..count {
            let reg = addr.wrapping_add(i);
            let width = layout.width(reg);
            let chunk = data.get(pos..pos + width).ok_or(())?;
            pos += width;
            raw.extend_from_slice(chunk).map_err(|_| ())?;
            if self.crc_enabled {
                let mut crc = if i == 0 { crc8(0, &[addr_w, addr]) } else { 0 };
                crc = crc8(crc, chunk);
                raw.push(crc).map_err(|_| ())?;
            }
        }

        bus.write(self.address, &raw).map_err(|_| ())?;

        let first_width = layout.width(addr).min(data.len());
        let mut first: Vec<u8, MAX_REG_WIDTH> = Vec::new();
        first
            .extend_from_slice(&data[..first_width])
            .map_err(|_| ())?;
        Ok(first)
    }

    fn push_completion(&mut self, completion: Completion) {
        if self.completions.push_back(completion).is_err() {
            self.completions.pop_front();
            let _ = self.completions.push_back(completion);
        }
    }

    fn push_event(&mut self, event: ModuleEvent) {
        if self.events.push_back(event).is_err() {
            self.events.pop_front();
            let _ = self.events.push_back(event);
        }
    }
}

fn le_value(data: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    let n = data.len().min(4);
    word[..n].copy_from_slice(&data[..n]);
    u32::from_le_bytes(word)
}
