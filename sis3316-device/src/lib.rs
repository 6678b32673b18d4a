//! Register + bulk-read service and the double-buffered bank readout
//! controller, built on top of `sis3316-transport`.

use std::fmt;

use log::{debug, warn};

use sis3316_proto::AddressSpace;
use sis3316_regs::BitfieldDescriptor;
use sis3316_transport::{CongestionWindow, DatagramSocket, Sink, Transport, TransportError};

#[derive(Debug)]
pub enum DeviceError {
    Transport(TransportError),
    Regs(sis3316_regs::RegsError),
    /// The previous-bank identity changed mid-drain; the cycle must be
    /// abandoned and retried on the next `mem_toggle`.
    BankSwapDuringRead,
    /// The group's FIFO transfer-control register was still busy when the
    /// controller tried to reprogram it.
    TransferLogicBusy,
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::Transport(e) => write!(f, "{e}"),
            DeviceError::Regs(e) => write!(f, "{e}"),
            DeviceError::BankSwapDuringRead => {
                write!(f, "previous bank changed identity mid-drain")
            }
            DeviceError::TransferLogicBusy => write!(f, "fifo transfer-control register busy"),
        }
    }
}

impl std::error::Error for DeviceError {}

impl From<TransportError> for DeviceError {
    fn from(e: TransportError) -> Self {
        DeviceError::Transport(e)
    }
}

impl From<sis3316_regs::RegsError> for DeviceError {
    fn from(e: sis3316_regs::RegsError) -> Self {
        DeviceError::Regs(e)
    }
}

/// Register addresses used by the bank controller that are not part of the
/// per-channel/per-group parameter tables in `sis3316-regs` — these are the
/// state-machine "key" registers and bank bookkeeping, illustrative of the
/// external register catalog.
pub mod bank_addr {
    pub const KEY_DISARM: u32 = 0x0010;
    pub const KEY_ARM_BANK0: u32 = 0x0011;
    pub const KEY_ARM_BANK1: u32 = 0x0012;
    pub const BANK_SELECT_REG: u32 = 0x0014;
    /// Base of the per-(global channel) "previous bank end address" table;
    /// one register per global channel at `+ chan`.
    pub const CHAN_PREV_BANK_END_ADDR_BASE: u32 = 0x0200;
    /// Base of the per-group FIFO data-transfer-control register.
    pub const GROUP_FIFO_CTRL_REG_BASE: u32 = 0x0300;
}

/// Dispatches reads/writes by address range, and exposes the bitfield
/// convenience operations. This is the sole owner of the transport.
pub struct RegisterService<S: DatagramSocket> {
    transport: Transport<S>,
}

impl<S: DatagramSocket> RegisterService<S> {
    pub fn new(transport: Transport<S>) -> Self {
        Self { transport }
    }

    pub fn transport_mut(&mut self) -> &mut Transport<S> {
        &mut self.transport
    }

    pub fn read(&mut self, addr: u32) -> Result<u32, DeviceError> {
        Ok(self.transport.read(addr)?)
    }

    pub fn write(&mut self, addr: u32, data: u32) -> Result<(), DeviceError> {
        Ok(self.transport.write(addr, data)?)
    }

    pub fn read_list(&mut self, addrs: &[u32]) -> Result<Vec<u32>, DeviceError> {
        debug_assert!(addrs.iter().all(|&a| !matches!(
            sis3316_proto::classify(a),
            AddressSpace::Bulk
        )));
        Ok(self.transport.read_vme_list(addrs)?)
    }

    pub fn write_list(&mut self, pairs: &[(u32, u32)]) -> Result<(), DeviceError> {
        Ok(self.transport.write_vme_list(pairs)?)
    }

    pub fn get_field(&mut self, d: &BitfieldDescriptor) -> Result<u32, DeviceError> {
        let word = self.read(d.reg)?;
        Ok(d.get_field(word))
    }

    /// Read-modify-write: one read and one write, atomic from the host's
    /// standpoint (no concurrent writer to the same register is assumed).
    pub fn set_field(&mut self, d: &BitfieldDescriptor, value: u32) -> Result<(), DeviceError> {
        let word = self.read(d.reg)?;
        let updated = d.set_field(word, value)?;
        self.write(d.reg, updated)
    }
}

/// FIFO-space bulk reads, kept apart from `RegisterService` because they go
/// through `0x30` rather than `0x20`/`0x21`.
impl<S: DatagramSocket> RegisterService<S> {
    fn fifo_cmd_word(word_offset: u32) -> u32 {
        const OP_READ: u32 = 0b10;
        const MEM_SPACE: u32 = 0;
        (OP_READ << 30) | (MEM_SPACE << 28) | word_offset
    }

    /// Program and check the group's FIFO transfer-control register before
    /// a burst of `0x30` reads.
    fn program_fifo_ctrl(&mut self, group: u8, word_offset: u32) -> Result<(), DeviceError> {
        let reg = bank_addr::GROUP_FIFO_CTRL_REG_BASE + group as u32 * sis3316_regs::GROUP_REG_STRIDE;
        let status = self.read(reg)?;
        if status & (1 << 31) != 0 {
            return Err(DeviceError::TransferLogicBusy);
        }
        self.write(reg, Self::fifo_cmd_word(word_offset))
    }

    /// Idle the group's FIFO transfer-control register once a drain cycle
    /// is done, so a stale command word can't confuse the next cycle's
    /// busy-bit check.
    fn reset_fifo_ctrl(&mut self, group: u8) -> Result<(), DeviceError> {
        let reg = bank_addr::GROUP_FIFO_CTRL_REG_BASE + group as u32 * sis3316_regs::GROUP_REG_STRIDE;
        self.write(reg, 0)
    }
}

/// The bank's arm/disarm state machine. There is no other way to move
/// between states than writing one of the dedicated key registers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BankState {
    Disarmed,
    ArmedBank0,
    ArmedBank1,
}

/// Which bank is currently the "previous" (safe-to-read) one for a channel.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Bank {
    Bank0,
    Bank1,
}

/// Default chunk size, in words, between bank-identity reverifications
/// during a drain.
pub const DEFAULT_REVERIFY_CHUNK_WORDS: u32 = 1 << 18; // 1 MiB of words

pub struct BankController<S: DatagramSocket> {
    regs: RegisterService<S>,
    state: BankState,
}

impl<S: DatagramSocket> BankController<S> {
    pub fn new(regs: RegisterService<S>) -> Self {
        Self {
            regs,
            state: BankState::Disarmed,
        }
    }

    pub fn state(&self) -> BankState {
        self.state
    }

    pub fn regs_mut(&mut self) -> &mut RegisterService<S> {
        &mut self.regs
    }

    pub fn arm(&mut self, bank: Bank) -> Result<(), DeviceError> {
        let key = match bank {
            Bank::Bank0 => bank_addr::KEY_ARM_BANK0,
            Bank::Bank1 => bank_addr::KEY_ARM_BANK1,
        };
        self.regs.write(key, 1)?;
        self.state = match bank {
            Bank::Bank0 => BankState::ArmedBank0,
            Bank::Bank1 => BankState::ArmedBank1,
        };
        Ok(())
    }

    pub fn disarm(&mut self) -> Result<(), DeviceError> {
        self.regs.write(bank_addr::KEY_DISARM, 1)?;
        self.state = BankState::Disarmed;
        Ok(())
    }

    /// Disarm and immediately arm the opposite bank.
    pub fn mem_toggle(&mut self) -> Result<(), DeviceError> {
        let next = match self.state {
            BankState::ArmedBank0 => Bank::Bank1,
            BankState::ArmedBank1 | BankState::Disarmed => Bank::Bank0,
        };
        self.disarm()?;
        self.arm(next)
    }

    fn previous_bank_identity(&mut self) -> Result<(Bank, u32), DeviceError> {
        let select = self.regs.read(bank_addr::BANK_SELECT_REG)?;
        let active_is_bank1 = select & 1 != 0;
        Ok(if active_is_bank1 {
            (Bank::Bank0, 0)
        } else {
            (Bank::Bank1, 1 << 24)
        })
    }

    fn channel_end_address(&mut self, global_chan: u8) -> Result<u32, DeviceError> {
        self.regs
            .read(bank_addr::CHAN_PREV_BANK_END_ADDR_BASE + global_chan as u32)
    }

    /// Drain one channel's previous bank into `sink`, from word 0 to the
    /// bank's recorded end address, verifying the bank hasn't swapped out
    /// from under the read.
    pub fn drain_channel(
        &mut self,
        group: u8,
        global_chan: u8,
        sink: &mut dyn Sink,
    ) -> Result<u64, DeviceError> {
        use sis3316_proto::FIFO_READ_LIMIT_WORDS;

        let (bank, bank_offset) = self.previous_bank_identity()?;
        let end_words = self.channel_end_address(global_chan)?;

        let chan_offset = if global_chan % sis3316_regs::CHAN_PER_GROUP as u8 % 2 == 1 {
            1 << 25
        } else {
            0
        };
        let mem_base = bank_offset | chan_offset;

        let mut window =
            CongestionWindow::new(FIFO_READ_LIMIT_WORDS, self.regs.transport_mut().mtu_words());
        let mut done = 0u32;
        while done < end_words {
            let chunk_words = DEFAULT_REVERIFY_CHUNK_WORDS.min(end_words - done);
            self.regs.program_fifo_ctrl(group, mem_base + done)?;
            self.regs.transport_mut().read_fifo_congestion_controlled(
                mem_base + done,
                chunk_words,
                &mut window,
                sink,
            )?;
            done += chunk_words;

            let (bank_now, _) = self.previous_bank_identity()?;
            let end_now = self.channel_end_address(global_chan)?;
            if bank_now != bank || end_now != end_words {
                warn!(
                    "bank identity changed mid-drain for channel {global_chan} (was {bank:?}/{end_words}, now {bank_now:?}/{end_now})"
                );
                return Err(DeviceError::BankSwapDuringRead);
            }
        }
        self.regs.reset_fifo_ctrl(group)?;
        debug!("drained {done} words for channel {global_chan} from bank {bank:?}");
        Ok(sink.index())
    }
}
