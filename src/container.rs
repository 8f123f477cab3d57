//! Wire format for messages crossing a process boundary, used to
//! address actor instances confined to their own container.
//!
//! A message is one fixed-size frame: [`MAX_MEMBERS`] 64-bit slots
//! followed by a string buffer. Each slot is NaN-boxed: an ordinary
//! `f64` bit pattern is a number, while signalling-NaN patterns carry a
//! type tag in the mantissa (`nil`, `false`, `true`, `string`,
//! `file_descriptor`, `actor_address`). Strings and object keys live in
//! the string buffer, each preceded by a length byte. File descriptors
//! and addresses travel as `SCM_RIGHTS` ancillary data, one descriptor
//! per slot that requires one, in slot order.
//!
//! The root is either a single leaf (slot 0 holds the `nil` sentinel,
//! slot 1 the leaf) or an object of up to [`MAX_MEMBERS`] entries,
//! terminated by a `nil` slot when shorter than the full frame.
//!
//! The decoder trusts nothing: a frame coming from a confined process
//! is validated slot by slot, and every rejection path closes every
//! received descriptor. The supervisor survives arbitrary garbage.

use std::collections::HashSet;
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

/// Number of 64-bit slots in a frame.
pub const MAX_MEMBERS: usize = 16;

/// Size of the string buffer trailing the slots.
pub const STRBUF_SIZE: usize = 4096;

const MEMBERS_BYTES: usize = MAX_MEMBERS * 8;

/// Total size of a full frame.
pub const FRAME_SIZE: usize = MEMBERS_BYTES + STRBUF_SIZE;

const EXPONENT_MASK: u64 = 0x7FF0_0000_0000_0000;
const QNAN_BIT: u64 = 0x0008_0000_0000_0000;
const MANTISSA_MASK: u64 = 0x000F_FFFF_FFFF_FFFF;

const TAG_NIL: u64 = 1;
const TAG_FALSE: u64 = 2;
const TAG_TRUE: u64 = 3;
const TAG_STRING: u64 = 4;
const TAG_FILE_DESCRIPTOR: u64 = 5;
const TAG_ACTOR_ADDRESS: u64 = 6;

#[inline]
fn boxed(tag: u64) -> u64 {
    EXPONENT_MASK | tag
}

#[inline]
fn is_snan(word: u64) -> bool {
    word & EXPONENT_MASK == EXPONENT_MASK
        && word & QNAN_BIT == 0
        && word & MANTISSA_MASK != 0
}

/// Validation failure for one received frame.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum FrameError {
    #[error("frame shorter than two slots")]
    ShortRead,
    #[error("frame longer than the maximum message size")]
    LongRead,
    #[error("more descriptors than descriptor-bearing slots")]
    TooManyDescriptors,
    #[error("unknown signalling-NaN mantissa {0:#x}")]
    UnknownTag(u64),
    #[error("leaf requires a descriptor that was not attached")]
    MissingDescriptor,
    #[error("string length overruns the string buffer")]
    StrbufOverrun,
    #[error("object carries no entries")]
    EmptyObject,
    #[error("object is not terminated by a nil slot")]
    UnterminatedObject,
    #[error("string is longer than a length byte can describe")]
    StringTooLong,
    #[error("object carries more entries than the frame has slots")]
    TooManyEntries,
    #[error("duplicate object key")]
    DuplicateKey,
}

////////////////////////////////////////////////////////////////////////////////
// Message model
////////////////////////////////////////////////////////////////////////////////

/// One leaf of a container message.
#[derive(Debug)]
pub enum ContainerValue {
    Bool(bool),
    Number(f64),
    Str(String),
    /// A transferred file descriptor. Ownership moves with the
    /// message; a failed delivery closes it.
    Descriptor(OwnedFd),
    /// The channel endpoint of some actor, transferred as a descriptor.
    Address(OwnedFd),
}

/// A full container message: a single leaf or a flat object.
#[derive(Debug)]
pub enum ContainerMessage {
    Leaf(ContainerValue),
    Object(Vec<(String, ContainerValue)>),
}

////////////////////////////////////////////////////////////////////////////////
// Encoding
////////////////////////////////////////////////////////////////////////////////

struct FrameWriter {
    buf: Vec<u8>,
    strbuf_used: usize,
}

impl FrameWriter {
    fn new() -> Self {
        Self {
            buf: vec![0; FRAME_SIZE],
            strbuf_used: 0,
        }
    }

    fn set_slot(&mut self, index: usize, word: u64) {
        self.buf[index * 8..(index + 1) * 8].copy_from_slice(&word.to_le_bytes());
    }

    fn push_str(&mut self, s: &str) -> Result<(), FrameError> {
        if s.len() > u8::MAX as usize {
            return Err(FrameError::StringTooLong);
        }
        if self.strbuf_used + 1 + s.len() > STRBUF_SIZE {
            return Err(FrameError::StrbufOverrun);
        }
        let at = MEMBERS_BYTES + self.strbuf_used;
        self.buf[at] = s.len() as u8;
        self.buf[at + 1..at + 1 + s.len()].copy_from_slice(s.as_bytes());
        self.strbuf_used += 1 + s.len();
        Ok(())
    }
}

fn leaf_word(value: &ContainerValue, writer: &mut FrameWriter) -> Result<u64, FrameError> {
    Ok(match value {
        ContainerValue::Bool(false) => boxed(TAG_FALSE),
        ContainerValue::Bool(true) => boxed(TAG_TRUE),
        ContainerValue::Number(n) => {
            let word = n.to_bits();
            if is_snan(word) {
                // Signalling payloads collide with the tag space and
                // travel as a quiet NaN instead.
                f64::NAN.to_bits()
            } else {
                word
            }
        }
        ContainerValue::Str(s) => {
            writer.push_str(s)?;
            boxed(TAG_STRING)
        }
        ContainerValue::Descriptor(_) => boxed(TAG_FILE_DESCRIPTOR),
        ContainerValue::Address(_) => boxed(TAG_ACTOR_ADDRESS),
    })
}

/// Encodes a message into `(frame_bytes, descriptors)`. The descriptor
/// list borrows from `message`, in slot order.
pub fn encode(message: &ContainerMessage) -> Result<(Vec<u8>, Vec<RawFd>), FrameError> {
    let mut writer = FrameWriter::new();
    let mut descriptors = Vec::new();
    let collect_fd = |value: &ContainerValue, fds: &mut Vec<RawFd>| match value {
        ContainerValue::Descriptor(fd) | ContainerValue::Address(fd) => {
            fds.push(fd.as_raw_fd());
        }
        _ => {}
    };

    let used_strbuf;
    match message {
        ContainerMessage::Leaf(value) => {
            writer.set_slot(0, boxed(TAG_NIL));
            let word = leaf_word(value, &mut writer)?;
            writer.set_slot(1, word);
            collect_fd(value, &mut descriptors);
            used_strbuf = writer.strbuf_used;
            if used_strbuf == 0 {
                writer.buf.truncate(16);
                return Ok((writer.buf, descriptors));
            }
        }
        ContainerMessage::Object(entries) => {
            if entries.is_empty() {
                return Err(FrameError::EmptyObject);
            }
            if entries.len() > MAX_MEMBERS {
                return Err(FrameError::TooManyEntries);
            }
            for (i, (key, value)) in entries.iter().enumerate() {
                writer.push_str(key)?;
                let word = leaf_word(value, &mut writer)?;
                writer.set_slot(i, word);
                collect_fd(value, &mut descriptors);
            }
            if entries.len() < MAX_MEMBERS {
                writer.set_slot(entries.len(), boxed(TAG_NIL));
            }
            used_strbuf = writer.strbuf_used;
        }
    }
    writer.buf.truncate(MEMBERS_BYTES + used_strbuf);
    Ok((writer.buf, descriptors))
}

////////////////////////////////////////////////////////////////////////////////
// Decoding
////////////////////////////////////////////////////////////////////////////////

struct StrbufReader<'a> {
    strbuf: &'a [u8],
    pos: usize,
}

impl<'a> StrbufReader<'a> {
    fn read(&mut self) -> Result<String, FrameError> {
        let len = *self.strbuf.get(self.pos).ok_or(FrameError::StrbufOverrun)? as usize;
        let start = self.pos + 1;
        if start + len > self.strbuf.len() {
            return Err(FrameError::StrbufOverrun);
        }
        self.pos = start + len;
        Ok(String::from_utf8_lossy(&self.strbuf[start..start + len]).into_owned())
    }
}

enum Word {
    Nil,
    Bool(bool),
    Number(f64),
    Str,
    Descriptor,
    Address,
}

fn classify(word: u64) -> Result<Word, FrameError> {
    if !is_snan(word) {
        return Ok(Word::Number(f64::from_bits(word)));
    }
    match word & MANTISSA_MASK {
        TAG_NIL => Ok(Word::Nil),
        TAG_FALSE => Ok(Word::Bool(false)),
        TAG_TRUE => Ok(Word::Bool(true)),
        TAG_STRING => Ok(Word::Str),
        TAG_FILE_DESCRIPTOR => Ok(Word::Descriptor),
        TAG_ACTOR_ADDRESS => Ok(Word::Address),
        other => Err(FrameError::UnknownTag(other)),
    }
}

/// Validates and decodes one received frame. Takes ownership of the
/// received descriptors: whatever the outcome, none of them leaks —
/// they either end up inside the returned message or are closed before
/// this returns an error.
pub fn decode(frame: &[u8], fds: Vec<OwnedFd>) -> Result<ContainerMessage, FrameError> {
    if frame.len() < 16 {
        return Err(FrameError::ShortRead);
    }
    if frame.len() > FRAME_SIZE {
        return Err(FrameError::LongRead);
    }

    let slot_count = frame.len().min(MEMBERS_BYTES) / 8;
    let slot = |i: usize| -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&frame[i * 8..(i + 1) * 8]);
        u64::from_le_bytes(bytes)
    };
    let mut strings = StrbufReader {
        strbuf: if frame.len() > MEMBERS_BYTES {
            &frame[MEMBERS_BYTES..]
        } else {
            &[]
        },
        pos: 0,
    };
    let mut fds = fds.into_iter();

    fn take_fd(fds: &mut std::vec::IntoIter<OwnedFd>) -> Result<OwnedFd, FrameError> {
        fds.next().ok_or(FrameError::MissingDescriptor)
    }

    let message = match classify(slot(0))? {
        Word::Nil => {
            // Single-leaf form.
            let value = match classify(slot(1))? {
                Word::Nil => return Err(FrameError::EmptyObject),
                Word::Bool(b) => ContainerValue::Bool(b),
                Word::Number(n) => ContainerValue::Number(n),
                Word::Str => ContainerValue::Str(strings.read()?),
                Word::Descriptor => ContainerValue::Descriptor(take_fd(&mut fds)?),
                Word::Address => ContainerValue::Address(take_fd(&mut fds)?),
            };
            ContainerMessage::Leaf(value)
        }
        _ => {
            let mut entries = Vec::new();
            let mut seen = HashSet::new();
            let mut index = 0;
            loop {
                if index == MAX_MEMBERS {
                    break;
                }
                if index == slot_count {
                    return Err(FrameError::UnterminatedObject);
                }
                let word = classify(slot(index))?;
                if matches!(word, Word::Nil) {
                    break;
                }
                let key = strings.read()?;
                let value = match word {
                    Word::Nil => unreachable!(),
                    Word::Bool(b) => ContainerValue::Bool(b),
                    Word::Number(n) => ContainerValue::Number(n),
                    Word::Str => ContainerValue::Str(strings.read()?),
                    Word::Descriptor => ContainerValue::Descriptor(take_fd(&mut fds)?),
                    Word::Address => ContainerValue::Address(take_fd(&mut fds)?),
                };
                if !seen.insert(key.clone()) {
                    return Err(FrameError::DuplicateKey);
                }
                entries.push((key, value));
                index += 1;
            }
            ContainerMessage::Object(entries)
        }
    };

    if fds.next().is_some() {
        return Err(FrameError::TooManyDescriptors);
    }
    Ok(message)
}

////////////////////////////////////////////////////////////////////////////////
// Channel
////////////////////////////////////////////////////////////////////////////////

/// One endpoint of a supervisor/container message channel: a Unix
/// seqpacket socket carrying frames with descriptors in ancillary data.
#[derive(Debug)]
pub struct ContainerChannel {
    fd: OwnedFd,
}

impl ContainerChannel {
    /// Creates a connected endpoint pair.
    pub fn pair() -> io::Result<(Self, Self)> {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        unsafe {
            Ok((
                Self {
                    fd: OwnedFd::from_raw_fd(fds[0]),
                },
                Self {
                    fd: OwnedFd::from_raw_fd(fds[1]),
                },
            ))
        }
    }

    pub fn from_fd(fd: OwnedFd) -> Self {
        Self { fd }
    }

    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }

    /// Sends a message. Consumes it: descriptors are transferred with
    /// capability semantics, so the local copies are closed whether the
    /// delivery succeeded or not.
    pub fn send(&self, message: ContainerMessage) -> crate::Result<()> {
        let (frame, descriptors) = encode(&message)?;

        let mut iov = libc::iovec {
            iov_base: frame.as_ptr() as *mut libc::c_void,
            iov_len: frame.len(),
        };
        // Large enough for CMSG_SPACE of MAX_MEMBERS descriptors.
        let mut control = [0u8; 256];
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        if !descriptors.is_empty() {
            msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen =
                unsafe { libc::CMSG_SPACE((descriptors.len() * 4) as u32) } as _;
            unsafe {
                let cmsg = libc::CMSG_FIRSTHDR(&msg);
                (*cmsg).cmsg_level = libc::SOL_SOCKET;
                (*cmsg).cmsg_type = libc::SCM_RIGHTS;
                (*cmsg).cmsg_len = libc::CMSG_LEN((descriptors.len() * 4) as u32) as _;
                std::ptr::copy_nonoverlapping(
                    descriptors.as_ptr() as *const u8,
                    libc::CMSG_DATA(cmsg),
                    descriptors.len() * 4,
                );
            }
        }

        let sent = unsafe { libc::sendmsg(self.fd.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) };
        // `message` drops here, closing the sender-side descriptors on
        // both the success and the failure path.
        if sent < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Receives and validates one message. Every descriptor attached to
    /// a rejected frame is closed before the error is returned.
    pub fn recv(&self) -> crate::Result<ContainerMessage> {
        let mut frame = [0u8; FRAME_SIZE];
        let mut iov = libc::iovec {
            iov_base: frame.as_mut_ptr() as *mut libc::c_void,
            iov_len: frame.len(),
        };
        // Room for one descriptor more than a valid frame may carry, so
        // an over-stuffed message surfaces as TooManyDescriptors
        // instead of silently truncated ancillary data.
        let mut control = [0u8; 256];
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = control.len() as _;

        let nread = unsafe { libc::recvmsg(self.fd.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) };
        if nread < 0 {
            return Err(io::Error::last_os_error().into());
        }

        // Take ownership of every received descriptor before any
        // validation, so the error paths below cannot leak them.
        let mut fds = Vec::new();
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET
                    && (*cmsg).cmsg_type == libc::SCM_RIGHTS
                {
                    let payload = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                    let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                    for i in 0..payload / 4 {
                        fds.push(OwnedFd::from_raw_fd(*data.add(i)));
                    }
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }

        if msg.msg_flags & libc::MSG_TRUNC != 0 {
            return Err(FrameError::LongRead.into());
        }
        if msg.msg_flags & libc::MSG_CTRUNC != 0 {
            // The kernel closed whatever did not fit; what we did get
            // is closed by dropping `fds`.
            return Err(FrameError::TooManyDescriptors.into());
        }
        decode(&frame[..nread as usize], fds).map_err(Into::into)
    }
}

impl AsRawFd for ContainerChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl IntoRawFd for ContainerChannel {
    fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }
}
