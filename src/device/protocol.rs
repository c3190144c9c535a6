//! Command and acknowledge packet formats.
//!
//! A command header is eight 32-bit words sent as four 64-bit bus packets.
//! Words are packed little-endian, two per packet:
//!
//! ```text
//! packet | low word  | high word
//! -------+-----------+----------
//!   0    | s_key     | command
//!   1    | size      | tx_addr
//!   2    | trans_id  | reserved
//!   3    | e_key     | chksum
//!
//! command = [30] type (0 kernel, 1 subject) | [29:0] out_addr >> 3
//! size    = [31:16] rows | [15:0] cols
//! chksum  = XOR of the seven other words
//! ```
//!
//! The acknowledge packet has the same shape with `status` in place of
//! `reserved`; its checksum covers its own seven other words.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Start-of-header sentinel.
pub const S_KEY: u32 = 0xCAFE_CAFE;

/// End-of-header sentinel.
pub const E_KEY: u32 = 0xDEAD_BEEF;

/// Bus packet width in bytes.
pub const PACKET_BYTES: usize = 8;

/// 32-bit words in a command or acknowledge header.
pub const HEADER_WORDS: usize = 8;

/// 64-bit bus packets in a command or acknowledge header.
pub const HEADER_PACKETS: usize = HEADER_WORDS / 2;

const TYPE_SHIFT: u32 = 30;
const OUT_ADDR_MASK: u32 = (1 << TYPE_SHIFT) - 1;

/// Operation requested by a command header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    /// Load the convolution kernel.
    Kernel,
    /// Stream a subject matrix and convolve it with the loaded kernel.
    Subject,
}

impl CommandType {
    /// Type bit as carried in the command word.
    pub fn bit(self) -> u32 {
        match self {
            CommandType::Kernel => 0,
            CommandType::Subject => 1,
        }
    }

    /// Decode the type bit of a command word.
    pub fn from_command_word(command: u32) -> Self {
        if (command >> TYPE_SHIFT) & 1 == 0 {
            CommandType::Kernel
        } else {
            CommandType::Subject
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandType::Kernel => write!(f, "kernel"),
            CommandType::Subject => write!(f, "subject"),
        }
    }
}

/// Acknowledge status bitmask. Bits are independent and may co-occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Status(u32);

impl Status {
    pub const OK: Status = Status(0);
    /// Ack/command correspondence fault or an invalid transition.
    pub const ERR_OTHER: Status = Status(0x01);
    /// Kernel or subject shape not supported.
    pub const ERR_SIZE: Status = Status(0x02);
    /// Command arrived in the wrong order.
    pub const ERR_ORD: Status = Status(0x04);
    /// Start or end sentinel mismatch.
    pub const ERR_KEY: Status = Status(0x08);
    /// Header checksum mismatch.
    pub const ERR_CHKSM: Status = Status(0x10);

    /// Width of the status field in the state register.
    pub const BITS: u32 = 5;

    const NAMES: [(Status, &'static str); 5] = [
        (Status::ERR_OTHER, "ERR_OTHER"),
        (Status::ERR_SIZE, "ERR_SIZE"),
        (Status::ERR_ORD, "ERR_ORD"),
        (Status::ERR_KEY, "ERR_KEY"),
        (Status::ERR_CHKSM, "ERR_CHKSM"),
    ];

    pub fn from_bits(bits: u32) -> Self {
        Status(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// True if every bit of `other` is set in `self`.
    pub fn contains(self, other: Status) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Status) {
        self.0 |= other.0;
    }
}

impl BitOr for Status {
    type Output = Status;

    fn bitor(self, rhs: Status) -> Status {
        Status(self.0 | rhs.0)
    }
}

impl BitOrAssign for Status {
    fn bitor_assign(&mut self, rhs: Status) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            return write!(f, "OK");
        }

        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }

        let unknown = self.0 & !0x1F;
        if unknown != 0 {
            if !first {
                write!(f, "|")?;
            }
            write!(f, "0x{:x}", unknown)?;
        }
        Ok(())
    }
}

/// Build the command word from a type and an 8-byte aligned output address.
pub fn encode_command(cmd_type: CommandType, out_addr: u64) -> u32 {
    (cmd_type.bit() << TYPE_SHIFT) | (((out_addr >> 3) as u32) & OUT_ADDR_MASK)
}

/// Build the size word (simple encoding).
pub fn encode_size(rows: u16, cols: u16) -> u32 {
    ((rows as u32) << 16) | cols as u32
}

/// XOR of a slice of header words.
pub fn xor_checksum(words: &[u32]) -> u32 {
    words.iter().fold(0, |acc, w| acc ^ w)
}

fn words_to_packets(words: &[u32; HEADER_WORDS]) -> [u64; HEADER_PACKETS] {
    let mut packets = [0u64; HEADER_PACKETS];
    for (i, packet) in packets.iter_mut().enumerate() {
        *packet = words[2 * i] as u64 | ((words[2 * i + 1] as u64) << 32);
    }
    packets
}

fn packets_to_words(packets: &[u64; HEADER_PACKETS]) -> [u32; HEADER_WORDS] {
    let mut words = [0u32; HEADER_WORDS];
    for (i, packet) in packets.iter().enumerate() {
        words[2 * i] = *packet as u32;
        words[2 * i + 1] = (*packet >> 32) as u32;
    }
    words
}

/// Split a header packet into its (low, high) words.
#[inline]
pub fn split_packet(packet: u64) -> (u32, u32) {
    (packet as u32, (packet >> 32) as u32)
}

/// Command header as sent by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandPacket {
    pub s_key: u32,
    pub command: u32,
    pub size: u32,
    pub tx_addr: u32,
    pub trans_id: u32,
    pub reserved: u32,
    pub e_key: u32,
    pub chksum: u32,
}

impl CommandPacket {
    /// Build a well-formed header with a correct checksum.
    pub fn new(
        cmd_type: CommandType,
        rows: u16,
        cols: u16,
        tx_addr: u32,
        out_addr: u64,
        trans_id: u32,
    ) -> Self {
        let mut cmd = Self {
            s_key: S_KEY,
            command: encode_command(cmd_type, out_addr),
            size: encode_size(rows, cols),
            tx_addr,
            trans_id,
            reserved: 0,
            e_key: E_KEY,
            chksum: 0,
        };
        cmd.chksum = cmd.expected_checksum();
        cmd
    }

    pub fn words(&self) -> [u32; HEADER_WORDS] {
        [
            self.s_key,
            self.command,
            self.size,
            self.tx_addr,
            self.trans_id,
            self.reserved,
            self.e_key,
            self.chksum,
        ]
    }

    pub fn from_words(words: [u32; HEADER_WORDS]) -> Self {
        Self {
            s_key: words[0],
            command: words[1],
            size: words[2],
            tx_addr: words[3],
            trans_id: words[4],
            reserved: words[5],
            e_key: words[6],
            chksum: words[7],
        }
    }

    pub fn to_packets(&self) -> [u64; HEADER_PACKETS] {
        words_to_packets(&self.words())
    }

    pub fn from_packets(packets: [u64; HEADER_PACKETS]) -> Self {
        Self::from_words(packets_to_words(&packets))
    }

    /// XOR of the seven non-checksum words.
    pub fn expected_checksum(&self) -> u32 {
        xor_checksum(&self.words()[..HEADER_WORDS - 1])
    }

    pub fn checksum_ok(&self) -> bool {
        self.chksum == self.expected_checksum()
    }

    pub fn cmd_type(&self) -> CommandType {
        CommandType::from_command_word(self.command)
    }

    /// Output byte address carried in the command word.
    pub fn out_addr(&self) -> u64 {
        ((self.command & OUT_ADDR_MASK) as u64) << 3
    }

    pub fn rows(&self) -> u16 {
        (self.size >> 16) as u16
    }

    pub fn cols(&self) -> u16 {
        self.size as u16
    }

    /// Number of payload bytes the header announces.
    pub fn expected_elements(&self) -> u32 {
        self.rows() as u32 * self.cols() as u32
    }

    /// Number of payload packets that carry the announced bytes.
    pub fn payload_packets(&self) -> u32 {
        self.expected_elements().div_ceil(PACKET_BYTES as u32)
    }
}

impl fmt::Display for CommandPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cmd #{} {} {}x{} out=0x{:x} tx=0x{:x}",
            self.trans_id,
            self.cmd_type(),
            self.rows(),
            self.cols(),
            self.out_addr(),
            self.tx_addr
        )
    }
}

/// Acknowledge packet written back by the accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AckPacket {
    pub s_key: u32,
    pub command: u32,
    pub size: u32,
    pub tx_addr: u32,
    pub trans_id: u32,
    pub status: Status,
    pub e_key: u32,
    pub chksum: u32,
}

impl AckPacket {
    pub fn words(&self) -> [u32; HEADER_WORDS] {
        [
            self.s_key,
            self.command,
            self.size,
            self.tx_addr,
            self.trans_id,
            self.status.bits(),
            self.e_key,
            self.chksum,
        ]
    }

    pub fn from_words(words: [u32; HEADER_WORDS]) -> Self {
        Self {
            s_key: words[0],
            command: words[1],
            size: words[2],
            tx_addr: words[3],
            trans_id: words[4],
            status: Status::from_bits(words[5]),
            e_key: words[6],
            chksum: words[7],
        }
    }

    pub fn to_packets(&self) -> [u64; HEADER_PACKETS] {
        words_to_packets(&self.words())
    }

    pub fn from_packets(packets: [u64; HEADER_PACKETS]) -> Self {
        Self::from_words(packets_to_words(&packets))
    }

    pub fn expected_checksum(&self) -> u32 {
        xor_checksum(&self.words()[..HEADER_WORDS - 1])
    }

    /// Recompute the checksum after the fields are final.
    pub fn seal(&mut self) {
        self.chksum = self.expected_checksum();
    }

    pub fn checksum_ok(&self) -> bool {
        self.chksum == self.expected_checksum()
    }

    /// Field-for-field correspondence with the command it answers.
    pub fn matches(&self, cmd: &CommandPacket) -> bool {
        self.s_key == cmd.s_key
            && self.command == cmd.command
            && self.size == cmd.size
            && self.tx_addr == cmd.tx_addr
            && self.trans_id == cmd.trans_id
            && self.e_key == cmd.e_key
    }
}
