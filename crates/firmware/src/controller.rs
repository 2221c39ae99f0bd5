//! Controller node: one master client per peripheral module.
//!
//! The controller owns the module-interface clients, sequences their init
//! handshakes, re-initialises on module resets, and exposes a typed facade
//! over the register shadows for the application layer. All bus work runs
//! from the main loop; the interrupt-line ISRs only latch edges into the
//! I²C clients.

use battery::registers as bms_regs;
use battery::{BMS_MODULE_ID, BMS_SHADOW_SIZE};
use dsp::registers as dap_regs;
use dsp::registers::{DAP_MODULE_ID, DAP_SHADOW_SIZE};
use embedded_hal::i2c::I2c;
use heapless::Vec;
use modules::init::InitStatus;
use modules::interrupts::INT_RESET;
use modules::transfer::EnqueueError;
use modules::{I2cMaster, InitPlan, ModuleEvent, ModuleInit, Token, UartMaster};
use platform::timing::{cycles, Cycles};
use poweramp::registers as amp_regs;
use poweramp::{AMP_MODULE_ID, AMP_SHADOW_SIZE};

/// Bluetooth-receiver register map (the module itself wraps a vendor serial
/// Bluetooth part; the controller only needs the register contract).
pub mod btrx {
    use modules::{total_size, RegisterLayout};

    /// General status (2 B bit field, r).
    pub const REG_STATUS: u8 = 0x00;
    /// Absolute volume 0–127 (1 B, rw).
    pub const REG_VOLUME: u8 = 0x01;
    /// Track title (≤ 32 B string, r).
    pub const REG_TITLE: u8 = 0x02;
    /// Track artist (≤ 32 B string, r).
    pub const REG_ARTIST: u8 = 0x03;
    /// Track album (≤ 32 B string, r).
    pub const REG_ALBUM: u8 = 0x04;
    /// Connected device address (6 B, r).
    pub const REG_DEVICE_ADDR: u8 = 0x05;
    /// Connected device name (≤ 32 B string, r).
    pub const REG_DEVICE_NAME: u8 = 0x06;
    /// RSSI + link quality (4 B, r).
    pub const REG_CONN_STATS: u8 = 0x07;
    /// Active codec name (≤ 32 B string, r).
    pub const REG_CODEC: u8 = 0x08;
    /// Change-notification mask (2 B, rw).
    pub const REG_NOTIF_MASK: u8 = 0x20;
    /// General control (1 B, rw).
    pub const REG_CONTROL: u8 = 0x30;
    /// Connection control (1 B, w).
    pub const REG_CONN_CONTROL: u8 = 0x31;
    /// Media control (1 B enum, w).
    pub const REG_MEDIA_CONTROL: u8 = 0x32;
    /// Module identity (1 B, r).
    pub const REG_MODULE_ID: u8 = 0xFE;

    /// MODULE_ID constant of the Bluetooth receiver.
    pub const BTRX_MODULE_ID: u8 = 0xB7;

    /// STATUS bits.
    pub mod status {
        /// Radio stack initialised.
        pub const INIT_DONE: u16 = 0x0001;
        /// Connectable.
        pub const CONNECTABLE: u16 = 0x0002;
        /// Discoverable.
        pub const DISCOVERABLE: u16 = 0x0004;
        /// A device is connected.
        pub const CONNECTED: u16 = 0x0008;
        /// Audio stream link up.
        pub const A2DP_LINK: u16 = 0x0010;
        /// Media-control link up.
        pub const AVRCP_LINK: u16 = 0x0020;
        /// Audio streaming.
        pub const A2DP_STREAMING: u16 = 0x0040;
        /// Remote reports playing.
        pub const AVRCP_PLAYING: u16 = 0x0080;
    }

    /// Media-control actions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[repr(u8)]
    pub enum MediaControl {
        /// Start playback.
        Play = 0x01,
        /// Pause playback.
        Pause = 0x02,
        /// Stop playback.
        Stop = 0x03,
        /// Next track.
        Forward = 0x04,
        /// Previous track.
        Backward = 0x05,
    }

    const fn widths() -> [u8; 256] {
        let mut w = [0u8; 256];
        w[REG_STATUS as usize] = 2;
        w[REG_VOLUME as usize] = 1;
        w[REG_TITLE as usize] = 32;
        w[REG_ARTIST as usize] = 32;
        w[REG_ALBUM as usize] = 32;
        w[REG_DEVICE_ADDR as usize] = 6;
        w[REG_DEVICE_NAME as usize] = 32;
        w[REG_CONN_STATS as usize] = 4;
        w[REG_CODEC as usize] = 32;
        w[REG_NOTIF_MASK as usize] = 2;
        w[REG_CONTROL as usize] = 1;
        w[REG_CONN_CONTROL as usize] = 1;
        w[REG_MEDIA_CONTROL as usize] = 1;
        w[REG_MODULE_ID as usize] = 1;
        w
    }

    /// Width table of the Bluetooth-receiver map.
    pub static BTRX_WIDTHS: [u8; 256] = widths();
    /// Packed shadow size of the Bluetooth-receiver map.
    pub const BTRX_SHADOW_SIZE: usize = total_size(&BTRX_WIDTHS);

    /// Layout handle.
    #[must_use]
    pub fn btrx_layout() -> RegisterLayout {
        RegisterLayout::new(&BTRX_WIDTHS)
    }
}

/// Bus addresses of the I²C modules.
pub const AMP_BUS_ADDR: u8 = 0x2A;
/// See [`AMP_BUS_ADDR`].
pub const DAP_BUS_ADDR: u8 = 0x2B;

/// Retry delay after a failed module init.
const INIT_RETRY_DELAY: Cycles = cycles(1000);

fn bt_ready(status: u32) -> bool {
    status as u16 & btrx::status::INIT_DONE != 0
}

static BATTERY_PLAN: InitPlan = InitPlan {
    module_id_addr: bms_regs::REG_MODULE_ID,
    expected_id: BMS_MODULE_ID,
    enable_writes: &[(bms_regs::REG_NOTIF_MASK, &[0xFF, 0x0F])],
    ready: None,
    prefetch: &[
        bms_regs::REG_STATUS,
        bms_regs::REG_STACK_VOLTAGE,
        bms_regs::REG_CELL_VOLTAGES,
        bms_regs::REG_CURRENT,
        bms_regs::REG_SOC_FRACTION,
        bms_regs::REG_SOC_ENERGY,
        bms_regs::REG_HEALTH,
        bms_regs::REG_BAT_TEMP,
        bms_regs::REG_INT_TEMP,
        bms_regs::REG_ALERTS,
        bms_regs::REG_FAULTS,
        bms_regs::REG_SHUTDOWN,
        bms_regs::REG_CELLS_SERIES,
        bms_regs::REG_CELLS_PARALLEL,
        bms_regs::REG_MIN_VOLTAGE,
        bms_regs::REG_MAX_VOLTAGE,
        bms_regs::REG_MAX_DSG_CURRENT,
        bms_regs::REG_PEAK_DSG_CURRENT,
        bms_regs::REG_MAX_CHG_CURRENT,
    ],
    timeout: cycles(2000),
};

static BTRX_PLAN: InitPlan = InitPlan {
    module_id_addr: btrx::REG_MODULE_ID,
    expected_id: btrx::BTRX_MODULE_ID,
    enable_writes: &[(btrx::REG_NOTIF_MASK, &[0xFF, 0x01])],
    ready: Some(modules::init::ReadyCheck {
        status_addr: btrx::REG_STATUS,
        poll_period: cycles(100),
        is_ready: bt_ready,
    }),
    prefetch: &[
        btrx::REG_VOLUME,
        btrx::REG_TITLE,
        btrx::REG_ARTIST,
        btrx::REG_ALBUM,
        btrx::REG_DEVICE_ADDR,
        btrx::REG_DEVICE_NAME,
        btrx::REG_CONN_STATS,
        btrx::REG_CODEC,
    ],
    // the radio stack takes seconds to come up
    timeout: cycles(4000),
};

static AMP_PLAN: InitPlan = InitPlan {
    module_id_addr: amp_regs::REG_MODULE_ID,
    expected_id: AMP_MODULE_ID,
    enable_writes: &[
        (amp_regs::REG_INT_MASK, &[0xFF]),
        // interrupts on, amp initially held in manual shutdown
        (amp_regs::REG_CONTROL, &[0x03]),
    ],
    ready: None,
    prefetch: &[
        amp_regs::REG_STATUS,
        amp_regs::REG_PVDD_TARGET,
        amp_regs::REG_PVDD_REQ,
        amp_regs::REG_PVDD_MEASURED,
        amp_regs::REG_SAFETY_STATUS,
        amp_regs::REG_SERR_SOURCE,
        amp_regs::REG_SWARN_SOURCE,
    ],
    timeout: cycles(1000),
};

static DAP_PLAN: InitPlan = InitPlan {
    module_id_addr: dap_regs::REG_MODULE_ID,
    expected_id: DAP_MODULE_ID,
    enable_writes: &[
        (dap_regs::REG_INT_MASK, &[0xFF]),
        (dap_regs::REG_CONTROL, &[0x01]),
    ],
    ready: None,
    prefetch: &[
        dap_regs::REG_STATUS,
        dap_regs::REG_INPUT_ACTIVE,
        dap_regs::REG_INPUTS_AVAILABLE,
        dap_regs::REG_I2S1_RATE,
        dap_regs::REG_I2S2_RATE,
        dap_regs::REG_I2S3_RATE,
        dap_regs::REG_SRC_INPUT_RATE,
    ],
    timeout: cycles(1000),
};

/// The four peripheral modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Module {
    /// Battery monitor (UART).
    Battery,
    /// Bluetooth receiver (UART).
    Bluetooth,
    /// Power amp (I²C).
    Amp,
    /// Audio processor (I²C).
    Dap,
}

/// Events surfaced to the application layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControllerEvent {
    /// A module finished (re-)initialisation.
    ModuleReady(Module),
    /// A module failed init (it will be retried).
    ModuleFailed(Module),
    /// A module reset itself and was re-initialised.
    ModuleReset(Module),
    /// A shadow register changed (UART change notification).
    RegisterChanged(Module, u8),
    /// A module reported an error event.
    RemoteError(Module, u16),
    /// Unmasked interrupt flags from an I²C module.
    Interrupt(Module, u8),
}

struct ModuleState {
    init: ModuleInit,
    ready_announced: bool,
    retry_in: Cycles,
}

impl ModuleState {
    fn new(plan: InitPlan) -> Self {
        Self {
            init: ModuleInit::new(plan),
            ready_announced: false,
            retry_in: 0,
        }
    }
}

/// The controller.
pub struct Controller {
    /// Battery-monitor client.
    pub battery: UartMaster<BMS_SHADOW_SIZE, 8>,
    /// Bluetooth-receiver client.
    pub bt: UartMaster<{ btrx::BTRX_SHADOW_SIZE }, 8>,
    /// Power-amp client.
    pub amp: I2cMaster<AMP_SHADOW_SIZE, 8>,
    /// Audio-processor client.
    pub dap: I2cMaster<DAP_SHADOW_SIZE, 8>,

    battery_state: ModuleState,
    bt_state: ModuleState,
    amp_state: ModuleState,
    dap_state: ModuleState,

    /// Whether the amp's output measurements are polled continuously.
    pub monitor_measurements: bool,

    events: heapless::Deque<ControllerEvent, 16>,
}

impl Controller {
    /// Build the controller and start every module's init sequence on the
    /// first poll.
    #[must_use]
    pub fn new() -> Self {
        Self {
            battery: UartMaster::new(bms_regs::bms_layout()),
            bt: UartMaster::new(btrx::btrx_layout()),
            amp: I2cMaster::new(
                amp_regs::amp_layout(),
                AMP_BUS_ADDR,
                amp_regs::REG_INT_FLAGS,
                true,
            ),
            dap: I2cMaster::new(
                dap_regs::dap_layout(),
                DAP_BUS_ADDR,
                dap_regs::REG_INT_FLAGS,
                true,
            ),
            battery_state: ModuleState::new(BATTERY_PLAN),
            bt_state: ModuleState::new(BTRX_PLAN),
            amp_state: ModuleState::new(AMP_PLAN),
            dap_state: ModuleState::new(DAP_PLAN),
            monitor_measurements: false,
            events: heapless::Deque::new(),
        }
    }

    /// Pop the next application-level event.
    pub fn next_event(&mut self) -> Option<ControllerEvent> {
        self.events.pop_front()
    }

    /// ISR entries for the links are forwarded to the clients directly
    /// (`battery.on_rx_byte`, `amp.on_interrupt_edge`, …).
    ///
    /// One main-loop cycle over all four modules.
    pub fn poll<B: I2c>(&mut self, i2c: &mut B, loop_count: u32) {
        // transport work
        self.battery.poll();
        self.bt.poll();
        self.amp.poll(i2c);
        self.dap.poll(i2c);

        // init sequencing
        Self::drive_init(&mut self.battery_state, &mut self.battery, Module::Battery, &mut self.events);
        Self::drive_init(&mut self.bt_state, &mut self.bt, Module::Bluetooth, &mut self.events);
        Self::drive_init(&mut self.amp_state, &mut self.amp, Module::Amp, &mut self.events);
        Self::drive_init(&mut self.dap_state, &mut self.dap, Module::Dap, &mut self.events);

        // event handling
        self.drain_battery_events();
        self.drain_bt_events();
        self.drain_amp_events();
        self.drain_dap_events();

        // periodic refreshes (the UART modules push change notifications;
        // the I²C modules are polled)
        if self.amp_state.init.status() == InitStatus::Done {
            if loop_count % 50 == 0 {
                let _ = self.amp.read_registers(amp_regs::REG_STATUS, 1);
                let _ = self.amp.read_registers(amp_regs::REG_SAFETY_STATUS, 3);
            }
            if loop_count % 100 == 10 {
                let _ = self.amp.read_registers(amp_regs::REG_PVDD_TARGET, 3);
                if self.monitor_measurements {
                    let _ = self.amp.read_registers(amp_regs::REG_MON_BASE, 32);
                }
            }
        }
        if self.dap_state.init.status() == InitStatus::Done && loop_count % 50 == 20 {
            let _ = self.dap.read_registers(dap_regs::REG_STATUS, 1);
            let _ = self.dap.read_register(dap_regs::REG_INPUTS_AVAILABLE);
        }
    }

    fn drive_init<C: modules::init::RegisterClient>(
        state: &mut ModuleState,
        client: &mut C,
        module: Module,
        events: &mut heapless::Deque<ControllerEvent, 16>,
    ) {
        match state.init.status() {
            InitStatus::Idle => state.init.start(client),
            InitStatus::InProgress => {
                if state.init.poll(client) == InitStatus::Done {
                    state.ready_announced = false;
                }
            }
            InitStatus::Done => {
                if !state.ready_announced {
                    state.ready_announced = true;
                    push_event(events, ControllerEvent::ModuleReady(module));
                }
            }
            InitStatus::Failed => {
                if state.retry_in == 0 {
                    push_event(events, ControllerEvent::ModuleFailed(module));
                    state.retry_in = INIT_RETRY_DELAY;
                } else {
                    state.retry_in -= 1;
                    if state.retry_in == 0 {
                        state.init.start(client);
                    }
                }
            }
        }
    }

    fn restart_init(
        state: &mut ModuleState,
        events: &mut heapless::Deque<ControllerEvent, 16>,
        module: Module,
    ) {
        state.ready_announced = false;
        state.retry_in = 0;
        state.init = ModuleInit::new(match module {
            Module::Battery => BATTERY_PLAN,
            Module::Bluetooth => BTRX_PLAN,
            Module::Amp => AMP_PLAN,
            Module::Dap => DAP_PLAN,
        });
        push_event(events, ControllerEvent::ModuleReset(module));
    }

    fn drain_battery_events(&mut self) {
        while let Some(event) = self.battery.next_event() {
            match event {
                ModuleEvent::ModuleReset => {
                    self.battery.abort_all();
                    Self::restart_init(&mut self.battery_state, &mut self.events, Module::Battery);
                }
                ModuleEvent::RegisterChanged(reg) => {
                    push_event(
                        &mut self.events,
                        ControllerEvent::RegisterChanged(Module::Battery, reg),
                    );
                }
                ModuleEvent::RemoteError(code) => {
                    push_event(
                        &mut self.events,
                        ControllerEvent::RemoteError(Module::Battery, code.0),
                    );
                }
                _ => {}
            }
        }
    }

    fn drain_bt_events(&mut self) {
        while let Some(event) = self.bt.next_event() {
            match event {
                ModuleEvent::ModuleReset => {
                    self.bt.abort_all();
                    Self::restart_init(&mut self.bt_state, &mut self.events, Module::Bluetooth);
                }
                ModuleEvent::BtReset => {
                    // radio restarted behind the module: refresh the metadata
                    for reg in [btrx::REG_TITLE, btrx::REG_ARTIST, btrx::REG_ALBUM, btrx::REG_CODEC]
                    {
                        let _ = self.bt.read_register(reg);
                    }
                }
                ModuleEvent::RegisterChanged(reg) => {
                    push_event(
                        &mut self.events,
                        ControllerEvent::RegisterChanged(Module::Bluetooth, reg),
                    );
                }
                ModuleEvent::RemoteError(code) => {
                    push_event(
                        &mut self.events,
                        ControllerEvent::RemoteError(Module::Bluetooth, code.0),
                    );
                }
                ModuleEvent::Interrupt(_) => {}
            }
        }
    }

    fn drain_amp_events(&mut self) {
        while let Some(event) = self.amp.next_event() {
            if let ModuleEvent::Interrupt(flags) = event {
                if flags & INT_RESET != 0 {
                    self.amp.abort_all();
                    Self::restart_init(&mut self.amp_state, &mut self.events, Module::Amp);
                    continue;
                }
                // any other interrupt is a status change
                let _ = self.amp.read_registers(amp_regs::REG_STATUS, 1);
                if flags & amp_regs::int_flags::SERR != 0 {
                    let _ = self.amp.read_registers(amp_regs::REG_SAFETY_STATUS, 2);
                }
                if flags & amp_regs::int_flags::SWARN != 0 {
                    let _ = self.amp.read_registers(amp_regs::REG_SWARN_SOURCE, 1);
                }
                if flags
                    & (amp_regs::int_flags::PVDD_ERR
                        | amp_regs::int_flags::PVDD_REDDONE
                        | amp_regs::int_flags::PVDD_OLIM)
                    != 0
                {
                    let _ = self.amp.read_registers(amp_regs::REG_PVDD_TARGET, 3);
                }
                push_event(&mut self.events, ControllerEvent::Interrupt(Module::Amp, flags));
            }
        }
    }

    fn drain_dap_events(&mut self) {
        while let Some(event) = self.dap.next_event() {
            if let ModuleEvent::Interrupt(flags) = event {
                if flags & INT_RESET != 0 {
                    self.dap.abort_all();
                    Self::restart_init(&mut self.dap_state, &mut self.events, Module::Dap);
                    continue;
                }
                let _ = self.dap.read_registers(dap_regs::REG_STATUS, 1);
                let _ = self.dap.read_register(dap_regs::REG_INPUT_ACTIVE);
                push_event(&mut self.events, ControllerEvent::Interrupt(Module::Dap, flags));
            }
        }
    }

    // ── typed facade ────────────────────────────────────────────────────

    /// Battery state of charge `(fraction, confidence)` from the shadow.
    #[must_use]
    pub fn battery_soc(&self) -> (f32, u8) {
        let bytes = self.battery.shadow().bytes(bms_regs::REG_SOC_FRACTION);
        if bytes.len() < 5 {
            return (f32::NAN, 0);
        }
        (
            f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            bytes[4],
        )
    }

    /// Request or cancel a host shutdown at the battery monitor.
    ///
    /// # Errors
    ///
    /// Enqueue errors from the client.
    pub fn request_battery_shutdown(&mut self, request: bool) -> Result<Token, EnqueueError> {
        let value = if request {
            bms_regs::control::REQ_SHUTDOWN
        } else {
            0
        };
        self.battery.write_register(bms_regs::REG_CONTROL, &[value])
    }

    /// Persist a new battery-health estimate.
    ///
    /// # Errors
    ///
    /// Enqueue errors from the client.
    pub fn write_battery_health(&mut self, fraction: f32) -> Result<Token, EnqueueError> {
        self.battery
            .write_register(bms_regs::REG_HEALTH, &fraction.to_le_bytes())
    }

    /// Amp STATUS word from the shadow.
    #[must_use]
    pub fn amp_status(&self) -> u16 {
        self.amp.shadow().reg16(amp_regs::REG_STATUS)
    }

    /// Measured PVDD rail voltage from the shadow.
    #[must_use]
    pub fn pvdd_measured(&self) -> f32 {
        self.amp.shadow().regf32(amp_regs::REG_PVDD_MEASURED)
    }

    /// Command a new PVDD target.
    ///
    /// # Errors
    ///
    /// [`EnqueueError::BadAccess`] for out-of-range voltages.
    pub fn set_pvdd_target(&mut self, volts: f32) -> Result<Token, EnqueueError> {
        if volts.is_nan()
            || !(poweramp::pvdd::MIN_VOLTAGE..=poweramp::pvdd::MAX_VOLTAGE).contains(&volts)
        {
            return Err(EnqueueError::BadAccess);
        }
        self.amp
            .write_register(amp_regs::REG_PVDD_TARGET, &volts.to_le_bytes())
    }

    /// Engage or release the amp's manual shutdown (interrupts stay on).
    ///
    /// # Errors
    ///
    /// Enqueue errors from the client.
    pub fn set_amp_manual_shutdown(&mut self, shutdown: bool) -> Result<Token, EnqueueError> {
        let value = 0x01 | if shutdown { 0x02 } else { 0x00 };
        self.amp.write_register(amp_regs::REG_CONTROL, &[value])
    }

    /// Write one full 15-register threshold block (inst/fast/slow × A–D+sum)
    /// starting at `base` (one of the SERR/SWARN block bases).
    ///
    /// # Errors
    ///
    /// Enqueue errors from the client.
    pub fn write_amp_thresholds(
        &mut self,
        base: u8,
        values: &[f32; 15],
    ) -> Result<Token, EnqueueError> {
        let mut data: Vec<u8, 60> = Vec::new();
        for v in values {
            data.extend_from_slice(&v.to_le_bytes())
                .map_err(|_| EnqueueError::BadAccess)?;
        }
        self.amp.write_registers(base, 15, &data)
    }

    /// Null-terminated string register from the Bluetooth shadow.
    #[must_use]
    pub fn bt_string(&self, reg: u8) -> &str {
        let bytes = self.bt.shadow().bytes(reg);
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        core::str::from_utf8(&bytes[..end]).unwrap_or("")
    }

    /// Send a media-control action to the Bluetooth receiver.
    ///
    /// # Errors
    ///
    /// Enqueue errors from the client.
    pub fn bt_media_control(&mut self, action: btrx::MediaControl) -> Result<Token, EnqueueError> {
        self.bt
            .write_register(btrx::REG_MEDIA_CONTROL, &[action as u8])
    }

    /// Set the Bluetooth absolute volume (0–127).
    ///
    /// # Errors
    ///
    /// [`EnqueueError::BadAccess`] for out-of-range volumes.
    pub fn bt_set_volume(&mut self, volume: u8) -> Result<Token, EnqueueError> {
        if volume > 127 {
            return Err(EnqueueError::BadAccess);
        }
        self.bt.write_register(btrx::REG_VOLUME, &[volume])
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

fn push_event(
    events: &mut heapless::Deque<ControllerEvent, 16>,
    event: ControllerEvent,
) {
    if events.push_back(event).is_err() {
        events.pop_front();
        let _ = events.push_back(event);
    }
}
