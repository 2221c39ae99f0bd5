//! Module initialisation handshake.
//!
//! The multi-step init sequence (verify module ID → enable interrupts and
//! notifications → populate the local shadow → optionally wait for the
//! module's own ready bit) is an explicit state machine driven once per main
//! loop cycle. It owns the client's completion stream while it runs; the
//! controller starts it, polls it, and restarts it when the module announces
//! a reset.

use platform::timing::Cycles;

use crate::transfer::{Completion, EnqueueError, Token};

/// Client operations the init sequence needs (implemented by both masters).
pub trait RegisterClient {
    /// Queue a single-register read.
    ///
    /// # Errors
    ///
    /// Enqueue errors from the underlying client.
    fn read_register(&mut self, addr: u8) -> Result<Token, EnqueueError>;

    /// Queue a single-register write.
    ///
    /// # Errors
    ///
    /// Enqueue errors from the underlying client.
    fn write_register(&mut self, addr: u8, data: &[u8]) -> Result<Token, EnqueueError>;

    /// Pop the next transfer completion.
    fn next_completion(&mut self) -> Option<Completion>;
}

impl<const SIZE: usize, const DEPTH: usize> RegisterClient
    for crate::uart_master::UartMaster<SIZE, DEPTH>
{
    fn read_register(&mut self, addr: u8) -> Result<Token, EnqueueError> {
        Self::read_register(self, addr)
    }

    fn write_register(&mut self, addr: u8, data: &[u8]) -> Result<Token, EnqueueError> {
        Self::write_register(self, addr, data)
    }

    fn next_completion(&mut self) -> Option<Completion> {
        Self::next_completion(self)
    }
}

impl<const SIZE: usize, const DEPTH: usize> RegisterClient
    for crate::i2c_master::I2cMaster<SIZE, DEPTH>
{
    fn read_register(&mut self, addr: u8) -> Result<Token, EnqueueError> {
        Self::read_register(self, addr)
    }

    fn write_register(&mut self, addr: u8, data: &[u8]) -> Result<Token, EnqueueError> {
        Self::write_register(self, addr, data)
    }

    fn next_completion(&mut self) -> Option<Completion> {
        Self::next_completion(self)
    }
}

/// Optional "module reports itself ready" gate between the enable writes and
/// the shadow prefetch (the Bluetooth receiver takes seconds to bring its
/// radio stack up).
#[derive(Clone, Copy)]
pub struct ReadyCheck {
    /// Status register to poll.
    pub status_addr: u8,
    /// Poll period in cycles.
    pub poll_period: Cycles,
    /// Predicate over the status register value.
    pub is_ready: fn(u32) -> bool,
}

/// Static description of one module's init sequence.
#[derive(Clone, Copy)]
pub struct InitPlan {
    /// Module-ID register address.
    pub module_id_addr: u8,
    /// Expected module-ID constant.
    pub expected_id: u8,
    /// Writes performed after ID verification (interrupt mask, notification
    /// mask, control), in order.
    pub enable_writes: &'static [(u8, &'static [u8])],
    /// Ready gate, if the module has one.
    pub ready: Option<ReadyCheck>,
    /// Registers prefetched into the shadow once the module is ready.
    pub prefetch: &'static [u8],
    /// Overall timeout for the whole sequence, in cycles.
    pub timeout: Cycles,
}

/// Progress of an init sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InitStatus {
    /// Not started.
    Idle,
    /// Running.
    InProgress,
    /// Completed successfully; the shadow is populated.
    Done,
    /// Failed (bad ID, transfer failure, or timeout).
    Failed,
}

enum State {
    Idle,
    ReadId(Token),
    Enable { index: usize, token: Token },
    WaitReady { poll_timer: Cycles, pending: Option<Token> },
    Prefetch { index: usize, token: Token },
    Done,
    Failed,
}

/// Driver for one module's [`InitPlan`].
pub struct ModuleInit {
    plan: InitPlan,
    state: State,
    remaining: Cycles,
}

impl ModuleInit {
    /// Create an idle init driver for `plan`.
    #[must_use]
    pub fn new(plan: InitPlan) -> Self {
        Self {
            plan,
            state: State::Idle,
            remaining: 0,
        }
    }

    /// Current progress.
    #[must_use]
    pub fn status(&self) -> InitStatus {
        match self.state {
            State::Idle => InitStatus::Idle,
            State::Done => InitStatus::Done,
            State::Failed => InitStatus::Failed,
            _ => InitStatus::InProgress,
        }
    }

    /// (Re)start the sequence.
    pub fn start<C: RegisterClient>(&mut self, client: &mut C) {
        self.remaining = self.plan.timeout;
        self.state = match client.read_register(self.plan.module_id_addr) {
            Ok(token) => State::ReadId(token),
            Err(_) => State::Failed,
        };
    }

    /// Drive the sequence; call once per main-loop cycle.
    pub fn poll<C: RegisterClient>(&mut self, client: &mut C) -> InitStatus {
        if matches!(self.state, State::Idle | State::Done | State::Failed) {
            return self.status();
        }

        if self.remaining == 0 {
            self.state = State::Failed;
            return InitStatus::Failed;
        }
        self.remaining -= 1;

        while let Some(completion) = client.next_completion() {
            self.on_completion(client, &completion);
            if matches!(self.state, State::Done | State::Failed) {
                return self.status();
            }
        }

        // ready-gate polling runs on a timer, independent of completions
        let mut issue_poll = false;
        if let State::WaitReady { poll_timer, pending } = &mut self.state {
            if pending.is_none() {
                if *poll_timer > 0 {
                    *poll_timer -= 1;
                } else {
                    issue_poll = true;
                }
            }
        }
        if issue_poll {
            if let Some(check) = self.plan.ready {
                match client.read_register(check.status_addr) {
                    Ok(token) => {
                        if let State::WaitReady { pending, .. } = &mut self.state {
                            *pending = Some(token);
                        }
                    }
                    Err(_) => self.state = State::Failed,
                }
            }
        }

        self.status()
    }

    fn on_completion<C: RegisterClient>(&mut self, client: &mut C, completion: &Completion) {
        match self.state {
            State::ReadId(token) if completion.token == token => {
                #[allow(clippy::cast_possible_truncation)] // ID registers are one byte
                let id = completion.value as u8;
                if completion.ok && id == self.plan.expected_id {
                    self.advance_enable(client, 0);
                } else {
                    self.state = State::Failed;
                }
            }
            State::Enable { index, token } if completion.token == token => {
                if completion.ok {
                    self.advance_enable(client, index + 1);
                } else {
                    self.state = State::Failed;
                }
            }
            State::WaitReady { pending: Some(token), .. } if completion.token == token => {
                if !completion.ok {
                    self.state = State::Failed;
                } else if self.plan.ready.is_some_and(|c| (c.is_ready)(completion.value)) {
                    self.advance_prefetch(client, 0);
                } else if let Some(check) = self.plan.ready {
                    self.state = State::WaitReady {
                        poll_timer: check.poll_period,
                        pending: None,
                    };
                }
            }
            State::Prefetch { index, token } if completion.token == token => {
                // prefetch reads populate the shadow; individual failures are
                // non-critical and do not abort the sequence
                self.advance_prefetch(client, index + 1);
            }
            _ => {}
        }
    }

    fn advance_enable<C: RegisterClient>(&mut self, client: &mut C, index: usize) {
        if let Some(&(addr, data)) = self.plan.enable_writes.get(index) {
            self.state = match client.write_register(addr, data) {
                Ok(token) => State::Enable { index, token },
                Err(_) => State::Failed,
            };
            return;
        }
        // enable writes done: ready gate or straight to prefetch
        if self.plan.ready.is_some() {
            self.state = State::WaitReady {
                poll_timer: 0,
                pending: None,
            };
        } else {
            self.advance_prefetch(client, 0);
        }
    }

    fn advance_prefetch<C: RegisterClient>(&mut self, client: &mut C, index: usize) {
        if let Some(&addr) = self.plan.prefetch.get(index) {
            self.state = match client.read_register(addr) {
                Ok(token) => State::Prefetch { index, token },
                Err(_) => State::Failed,
            };
        } else {
            self.state = State::Done;
        }
    }
}
