use pmtx_pmem::{Key, TableId};

/// Tag values as stored on NVM. Zero is deliberately unused: a zeroed page
/// decodes to "no record", which is how truncation detection works.
const TAG_START: u32 = 1;
const TAG_UPDATE: u32 = 2;
const TAG_INSERT: u32 = 3;
const TAG_DELETE: u32 = 4;
const TAG_COMMIT: u32 = 5;

/// tag + ts.
const FIXED_LEN: usize = 4 + 8;
/// table + row.
const KEY_LEN: usize = 4 + 8;

pub const START_LEN: usize = FIXED_LEN;
pub const COMMIT_LEN: usize = FIXED_LEN;
pub const DELETE_LEN: usize = FIXED_LEN + KEY_LEN;

/// A typed log record.
///
/// On NVM the layout is packed little-endian: `tag:u32`, `ts:u64`, then for
/// keyed records `table:u32`, `row:u64`, for Update/Insert `size:u32`, for
/// Update `offset:u32`, followed by exactly `size` payload bytes. A record is
/// only meaningful if a commit record with the same timestamp follows it in
/// its page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record<'a> {
    Start { ts: u64 },
    Update { ts: u64, key: Key, offset: u32, payload: &'a [u8] },
    Insert { ts: u64, key: Key, payload: &'a [u8] },
    Delete { ts: u64, key: Key },
    Commit { ts: u64 },
}

pub fn update_len(size: u32) -> usize {
    FIXED_LEN + KEY_LEN + 4 + 4 + size as usize
}

pub fn insert_len(size: u32) -> usize {
    FIXED_LEN + KEY_LEN + 4 + size as usize
}

impl<'a> Record<'a> {
    pub fn ts(&self) -> u64 {
        match *self {
            Record::Start { ts }
            | Record::Update { ts, .. }
            | Record::Insert { ts, .. }
            | Record::Delete { ts, .. }
            | Record::Commit { ts } => ts,
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Record::Start { .. } => START_LEN,
            Record::Commit { .. } => COMMIT_LEN,
            Record::Delete { .. } => DELETE_LEN,
            Record::Update { payload, .. } => update_len(payload.len() as u32),
            Record::Insert { payload, .. } => insert_len(payload.len() as u32),
        }
    }

    /// Serialize into `buf`, returning the number of bytes written.
    /// `buf` must be at least [`Self::encoded_len`] bytes.
    pub fn encode_into(&self, buf: &mut [u8]) -> usize {
        let mut w = Writer { buf, pos: 0 };
        match *self {
            Record::Start { ts } => {
                w.put_u32(TAG_START);
                w.put_u64(ts);
            }
            Record::Commit { ts } => {
                w.put_u32(TAG_COMMIT);
                w.put_u64(ts);
            }
            Record::Delete { ts, key } => {
                w.put_u32(TAG_DELETE);
                w.put_u64(ts);
                w.put_key(key);
            }
            Record::Update { ts, key, offset, payload } => {
                w.put_u32(TAG_UPDATE);
                w.put_u64(ts);
                w.put_key(key);
                w.put_u32(payload.len() as u32);
                w.put_u32(offset);
                w.put_bytes(payload);
            }
            Record::Insert { ts, key, payload } => {
                w.put_u32(TAG_INSERT);
                w.put_u64(ts);
                w.put_key(key);
                w.put_u32(payload.len() as u32);
                w.put_bytes(payload);
            }
        }
        w.pos
    }

    /// Decode one record from the front of `buf`.
    ///
    /// Returns the record and its encoded length, or `None` when the tag is
    /// not a known record tag or the buffer is too short for the record it
    /// announces. Both are treated by recovery as the end of the page.
    pub fn decode(buf: &'a [u8]) -> Option<(Record<'a>, usize)> {
        let mut r = Reader { buf, pos: 0 };
        let tag = r.get_u32()?;
        let ts = r.get_u64()?;
        let rec = match tag {
            TAG_START => Record::Start { ts },
            TAG_COMMIT => Record::Commit { ts },
            TAG_DELETE => Record::Delete { ts, key: r.get_key()? },
            TAG_UPDATE => {
                let key = r.get_key()?;
                let size = r.get_u32()?;
                let offset = r.get_u32()?;
                let payload = r.get_bytes(size as usize)?;
                Record::Update { ts, key, offset, payload }
            }
            TAG_INSERT => {
                let key = r.get_key()?;
                let size = r.get_u32()?;
                let payload = r.get_bytes(size as usize)?;
                Record::Insert { ts, key, payload }
            }
            _ => return None,
        };
        Some((rec, r.pos))
    }
}

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl Writer<'_> {
    fn put_u32(&mut self, v: u32) {
        self.buf[self.pos..self.pos + 4].copy_from_slice(&v.to_le_bytes());
        self.pos += 4;
    }

    fn put_u64(&mut self, v: u64) {
        self.buf[self.pos..self.pos + 8].copy_from_slice(&v.to_le_bytes());
        self.pos += 8;
    }

    fn put_key(&mut self, key: Key) {
        self.put_u32(key.table.0);
        self.put_u64(key.row);
    }

    fn put_bytes(&mut self, src: &[u8]) {
        self.buf[self.pos..self.pos + src.len()].copy_from_slice(src);
        self.pos += src.len();
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn get_u32(&mut self) -> Option<u32> {
        let bytes = self.buf.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn get_u64(&mut self) -> Option<u64> {
        let bytes = self.buf.get(self.pos..self.pos + 8)?;
        self.pos += 8;
        Some(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn get_key(&mut self) -> Option<Key> {
        let table = TableId(self.get_u32()?);
        let row = self.get_u64()?;
        Some(Key { table, row })
    }

    fn get_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let bytes = self.buf.get(self.pos..self.pos + len)?;
        self.pos += len;
        Some(bytes)
    }
}
