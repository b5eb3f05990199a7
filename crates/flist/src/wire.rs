//! On-wire file-entry codec.
//!
//! Entries travel with an XMIT flag word describing which fields repeat the
//! previous entry and how the name is prefix-compressed. The flag bits are
//! protocol-30 wire constants. Encoder and decoder keep symmetric dedup
//! state and reset it at each segment boundary, which is what makes every
//! segment self-describing for safe-file-list mode.

use std::io::{Read, Write};

use protocol::varint::{read_int, read_u8, read_var_int, read_var_long, write_int, write_u8,
    write_var_int, write_var_long};

use crate::attrs::FileAttrs;
use crate::entry::FileInfo;
use crate::error::FlistError;
use crate::principal::{Group, User};

/// Entry belongs to the transfer root.
pub const XMIT_TOP_DIR: u16 = 1 << 0;
/// Mode repeats the previous entry.
pub const XMIT_SAME_MODE: u16 = 1 << 1;
/// The flag word has a second byte.
pub const XMIT_EXTENDED_FLAGS: u16 = 1 << 2;
/// Owning user repeats the previous entry.
pub const XMIT_SAME_UID: u16 = 1 << 3;
/// Owning group repeats the previous entry.
pub const XMIT_SAME_GID: u16 = 1 << 4;
/// Name shares a prefix with the previous entry.
pub const XMIT_SAME_NAME: u16 = 1 << 5;
/// Name suffix length needs more than one byte.
pub const XMIT_LONG_NAME: u16 = 1 << 6;
/// Mtime repeats the previous entry.
pub const XMIT_SAME_TIME: u16 = 1 << 7;
/// A user name accompanies the uid.
pub const XMIT_USER_NAME_FOLLOWS: u16 = 1 << 10;
/// A group name accompanies the gid.
pub const XMIT_GROUP_NAME_FOLLOWS: u16 = 1 << 11;
/// Segment terminator flags an I/O error on the sending side.
pub const XMIT_IO_ERROR_ENDLIST: u16 = 1 << 12;

/// Sanity bound on a decoded path name.
const MAX_PATH_LEN: usize = 4096;

/// Options fixing which optional fields travel with each entry.
///
/// Both peers derive these from the negotiated session options; they must
/// agree or the stream desyncs.
#[derive(Debug, Clone, Copy, Default)]
pub struct WireOptions {
    /// Transmit owning users.
    pub preserve_uid: bool,
    /// Transmit owning groups.
    pub preserve_gid: bool,
    /// Transmit symlink targets.
    pub preserve_links: bool,
    /// Suppress principal names, ids only.
    pub numeric_ids: bool,
}

/// Encoder half of the entry codec. One per outbound segment stream.
#[derive(Debug)]
pub struct EntryEncoder {
    opts: WireOptions,
    prev_name: Vec<u8>,
    prev_mode: u32,
    prev_mtime: i64,
    prev_user: Option<User>,
    prev_group: Option<Group>,
}

impl EntryEncoder {
    #[must_use]
    pub fn new(opts: WireOptions) -> Self {
        Self {
            opts,
            prev_name: Vec::new(),
            prev_mode: 0,
            prev_mtime: 0,
            prev_user: None,
            prev_group: None,
        }
    }

    /// Encodes one entry.
    pub fn write_entry<W: Write>(
        &mut self,
        writer: &mut W,
        file: &FileInfo,
    ) -> Result<(), FlistError> {
        let attrs = file.attrs();
        let name = file.name();

        let mut flags: u16 = 0;
        if file.is_dot_dir() {
            flags |= XMIT_TOP_DIR;
        }
        if attrs.mode() == self.prev_mode {
            flags |= XMIT_SAME_MODE;
        }
        if attrs.mtime() == self.prev_mtime {
            flags |= XMIT_SAME_TIME;
        }

        let same_user = self.prev_user.as_ref() == Some(attrs.user());
        if self.opts.preserve_uid {
            if same_user {
                flags |= XMIT_SAME_UID;
            } else if !self.opts.numeric_ids {
                flags |= XMIT_USER_NAME_FOLLOWS;
            }
        }
        let same_group = self.prev_group.as_ref() == Some(attrs.group());
        if self.opts.preserve_gid {
            if same_group {
                flags |= XMIT_SAME_GID;
            } else if !self.opts.numeric_ids {
                flags |= XMIT_GROUP_NAME_FOLLOWS;
            }
        }

        let shared = common_prefix_len(&self.prev_name, name).min(255);
        let suffix_len = name.len() - shared;
        if shared > 0 {
            flags |= XMIT_SAME_NAME;
        }
        if suffix_len > 255 {
            flags |= XMIT_LONG_NAME;
        }

        // A zero flag byte terminates the segment, so a flagless entry
        // borrows a harmless bit or grows the extended form.
        if flags == 0 && !attrs.is_dir() {
            flags |= XMIT_TOP_DIR;
        }
        if flags & 0xFF00 != 0 || flags == 0 {
            flags |= XMIT_EXTENDED_FLAGS;
            write_u8(writer, flags as u8).map_err(protocol::ProtocolError::from)?;
            write_u8(writer, (flags >> 8) as u8).map_err(protocol::ProtocolError::from)?;
        } else {
            write_u8(writer, flags as u8).map_err(protocol::ProtocolError::from)?;
        }

        if flags & XMIT_SAME_NAME != 0 {
            write_u8(writer, shared as u8).map_err(protocol::ProtocolError::from)?;
        }
        if flags & XMIT_LONG_NAME != 0 {
            write_var_int(writer, suffix_len as i32).map_err(protocol::ProtocolError::from)?;
        } else {
            write_u8(writer, suffix_len as u8).map_err(protocol::ProtocolError::from)?;
        }
        writer
            .write_all(&name[shared..])
            .map_err(protocol::ProtocolError::from)?;

        write_var_long(writer, attrs.size() as i64, 3).map_err(protocol::ProtocolError::from)?;
        if flags & XMIT_SAME_TIME == 0 {
            write_var_long(writer, attrs.mtime(), 4).map_err(protocol::ProtocolError::from)?;
        }
        if flags & XMIT_SAME_MODE == 0 {
            write_int(writer, attrs.mode() as i32).map_err(protocol::ProtocolError::from)?;
        }

        if self.opts.preserve_uid && flags & XMIT_SAME_UID == 0 {
            write_var_int(writer, attrs.user().id() as i32)
                .map_err(protocol::ProtocolError::from)?;
            if flags & XMIT_USER_NAME_FOLLOWS != 0 {
                let bytes = attrs.user().name().as_bytes();
                write_u8(writer, bytes.len() as u8).map_err(protocol::ProtocolError::from)?;
                writer.write_all(bytes).map_err(protocol::ProtocolError::from)?;
            }
        }
        if self.opts.preserve_gid && flags & XMIT_SAME_GID == 0 {
            write_var_int(writer, attrs.group().id() as i32)
                .map_err(protocol::ProtocolError::from)?;
            if flags & XMIT_GROUP_NAME_FOLLOWS != 0 {
                let bytes = attrs.group().name().as_bytes();
                write_u8(writer, bytes.len() as u8).map_err(protocol::ProtocolError::from)?;
                writer.write_all(bytes).map_err(protocol::ProtocolError::from)?;
            }
        }

        if attrs.is_symlink() && self.opts.preserve_links {
            let target = file
                .link_target()
                .ok_or(FlistError::BadEntry("symlink without a target"))?;
            write_var_int(writer, target.len() as i32).map_err(protocol::ProtocolError::from)?;
            writer.write_all(target).map_err(protocol::ProtocolError::from)?;
        }

        self.prev_name = name.to_vec();
        self.prev_mode = attrs.mode();
        self.prev_mtime = attrs.mtime();
        self.prev_user = Some(attrs.user().clone());
        self.prev_group = Some(attrs.group().clone());
        Ok(())
    }

    /// Terminates the segment and resets the dedup state.
    pub fn write_segment_end<W: Write>(&mut self, writer: &mut W) -> Result<(), FlistError> {
        write_u8(writer, 0).map_err(protocol::ProtocolError::from)?;
        self.reset();
        Ok(())
    }

    fn reset(&mut self) {
        self.prev_name.clear();
        self.prev_mode = 0;
        self.prev_mtime = 0;
        self.prev_user = None;
        self.prev_group = None;
    }
}

/// Decoder half of the entry codec. One per inbound segment stream.
#[derive(Debug)]
pub struct EntryDecoder {
    opts: WireOptions,
    prev_name: Vec<u8>,
    prev_mode: u32,
    prev_mtime: i64,
    prev_user: Option<User>,
    prev_group: Option<Group>,
}

impl EntryDecoder {
    #[must_use]
    pub fn new(opts: WireOptions) -> Self {
        Self {
            opts,
            prev_name: Vec::new(),
            prev_mode: 0,
            prev_mtime: 0,
            prev_user: None,
            prev_group: None,
        }
    }

    /// Decodes the next entry, `None` at the segment terminator.
    pub fn read_entry<R: Read>(&mut self, reader: &mut R) -> Result<Option<FileInfo>, FlistError> {
        let first = read_u8(reader)?;
        if first == 0 {
            self.reset();
            return Ok(None);
        }

        let mut flags = u16::from(first);
        if flags & XMIT_EXTENDED_FLAGS != 0 {
            flags |= u16::from(read_u8(reader)?) << 8;
        }

        let shared = if flags & XMIT_SAME_NAME != 0 {
            usize::from(read_u8(reader)?)
        } else {
            0
        };
        if shared > self.prev_name.len() {
            return Err(FlistError::BadEntry("name prefix exceeds previous name"));
        }

        let suffix_len = if flags & XMIT_LONG_NAME != 0 {
            let len = read_var_int(reader)?;
            usize::try_from(len).map_err(|_| FlistError::BadEntry("negative name length"))?
        } else {
            usize::from(read_u8(reader)?)
        };
        if suffix_len == 0 || shared + suffix_len > MAX_PATH_LEN {
            return Err(FlistError::BadEntry("name length out of range"));
        }

        let mut name = Vec::with_capacity(shared + suffix_len);
        name.extend_from_slice(&self.prev_name[..shared]);
        let start = name.len();
        name.resize(shared + suffix_len, 0);
        reader
            .read_exact(&mut name[start..])
            .map_err(protocol::ProtocolError::from)?;

        let size = read_var_long(reader, 3)?;
        let size = u64::try_from(size).map_err(|_| FlistError::BadEntry("negative file size"))?;

        let mtime = if flags & XMIT_SAME_TIME != 0 {
            self.prev_mtime
        } else {
            read_var_long(reader, 4)?
        };
        if mtime < 0 {
            return Err(FlistError::BadEntry("negative mtime"));
        }

        let mode = if flags & XMIT_SAME_MODE != 0 {
            self.prev_mode
        } else {
            read_int(reader)? as u32
        };

        let user = if !self.opts.preserve_uid {
            User::nobody()
        } else if flags & XMIT_SAME_UID != 0 {
            self.prev_user
                .clone()
                .ok_or(FlistError::BadEntry("repeated uid without a previous entry"))?
        } else {
            let id = read_var_int(reader)?;
            let id = u32::try_from(id).map_err(|_| FlistError::BadEntry("negative uid"))?;
            if flags & XMIT_USER_NAME_FOLLOWS != 0 {
                let len = usize::from(read_u8(reader)?);
                let mut bytes = vec![0u8; len];
                reader
                    .read_exact(&mut bytes)
                    .map_err(protocol::ProtocolError::from)?;
                let text = String::from_utf8(bytes)
                    .map_err(|_| FlistError::BadEntry("user name is not UTF-8"))?;
                User::new(text, id)?
            } else {
                User::new(id.to_string(), id)?
            }
        };

        let group = if !self.opts.preserve_gid {
            Group::nobody()
        } else if flags & XMIT_SAME_GID != 0 {
            self.prev_group
                .clone()
                .ok_or(FlistError::BadEntry("repeated gid without a previous entry"))?
        } else {
            let id = read_var_int(reader)?;
            let id = u32::try_from(id).map_err(|_| FlistError::BadEntry("negative gid"))?;
            if flags & XMIT_GROUP_NAME_FOLLOWS != 0 {
                let len = usize::from(read_u8(reader)?);
                let mut bytes = vec![0u8; len];
                reader
                    .read_exact(&mut bytes)
                    .map_err(protocol::ProtocolError::from)?;
                let text = String::from_utf8(bytes)
                    .map_err(|_| FlistError::BadEntry("group name is not UTF-8"))?;
                Group::new(text, id)?
            } else {
                Group::new(id.to_string(), id)?
            }
        };

        let attrs = FileAttrs::new(mode, size, mtime, user, group);

        let link_target = if attrs.is_symlink() && self.opts.preserve_links {
            let len = read_var_int(reader)?;
            let len =
                usize::try_from(len).map_err(|_| FlistError::BadEntry("negative link length"))?;
            if len > MAX_PATH_LEN {
                return Err(FlistError::BadEntry("link target too long"));
            }
            let mut bytes = vec![0u8; len];
            reader
                .read_exact(&mut bytes)
                .map_err(protocol::ProtocolError::from)?;
            Some(bytes)
        } else {
            None
        };

        self.prev_name.clone_from(&name);
        self.prev_mode = attrs.mode();
        self.prev_mtime = attrs.mtime();
        self.prev_user = Some(attrs.user().clone());
        self.prev_group = Some(attrs.group().clone());

        let file = FileInfo::new(None, name, attrs, link_target)?;
        Ok(Some(file))
    }

    fn reset(&mut self) {
        self.prev_name.clear();
        self.prev_mode = 0;
        self.prev_mtime = 0;
        self.prev_user = None;
        self.prev_group = None;
    }
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}
