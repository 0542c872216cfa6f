use vbak_manifest::{KeyValueRecord, ManifestError, ManifestResult};
use vbak_types::{ChunkAddr, SessionName, StorageLayout, VolumeId, FORMAT_VERSION};

const NONE: &str = "none";

fn optional_name(record: &KeyValueRecord, key: &str) -> ManifestResult<Option<SessionName>> {
    match record.require(key)? {
        NONE => Ok(None),
        value => value
            .parse()
            .map(Some)
            .map_err(|_| ManifestError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
            }),
    }
}

fn name_or_none(name: Option<&SessionName>) -> String {
    name.map_or_else(|| NONE.to_string(), SessionName::to_string)
}

/// Metadata of one committed session (its `info` file).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub name: SessionName,
    /// Capture time, seconds since the UNIX epoch.
    pub captured_at: i64,
    pub volume_size: u64,
    pub chunk_size: u64,
    pub layout: StorageLayout,
    pub sequence: u64,
    pub previous: Option<SessionName>,
}

impl SessionRecord {
    /// A record for a new folder-layout session; chain position is filled
    /// in by [`SessionChain::append`](crate::SessionChain::append).
    pub fn new(name: SessionName, volume_size: u64, chunk_size: u64) -> Self {
        Self {
            name,
            captured_at: name
                .local_time()
                .map(|t| t.timestamp())
                .unwrap_or_else(|| name.time().and_utc().timestamp()),
            volume_size,
            chunk_size,
            layout: StorageLayout::Folders,
            sequence: 0,
            previous: None,
        }
    }

    /// Address of the last chunk of the recorded volume size.
    pub fn last_addr(&self) -> Option<ChunkAddr> {
        ChunkAddr::last_of(self.volume_size, self.chunk_size)
    }

    pub fn to_record(&self) -> KeyValueRecord {
        let mut record = KeyValueRecord::new();
        record
            .set("localtime", self.captured_at)
            .set("volsize", self.volume_size)
            .set("chunksize", self.chunk_size)
            .set("format", self.layout)
            .set("sequence", self.sequence)
            .set("previous", name_or_none(self.previous.as_ref()));
        record
    }

    pub fn from_record(name: SessionName, record: &KeyValueRecord) -> ManifestResult<Self> {
        Ok(Self {
            name,
            captured_at: record.parse("localtime")?,
            volume_size: record.parse("volsize")?,
            chunk_size: record.parse("chunksize")?,
            layout: record.parse("format")?,
            sequence: record.parse("sequence")?,
            previous: optional_name(record, "previous")?,
        })
    }
}

/// Metadata of one volume's archive (its `volinfo` file).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRecord {
    pub format_version: u32,
    pub id: VolumeId,
    pub first: Option<SessionName>,
    pub last: Option<SessionName>,
    /// Set while a merge rewrites session metadata; a record found with this
    /// flag set means local and destination metadata may disagree.
    pub meta_resync: bool,
}

impl VolumeRecord {
    pub fn new() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            id: VolumeId::generate(),
            first: None,
            last: None,
            meta_resync: false,
        }
    }

    pub fn to_record(&self) -> KeyValueRecord {
        let mut record = KeyValueRecord::new();
        record
            .set("format_ver", self.format_version)
            .set("uuid", self.id)
            .set("first", name_or_none(self.first.as_ref()))
            .set("last", name_or_none(self.last.as_ref()))
            .set("meta_resync", self.meta_resync);
        record
    }

    pub fn from_record(record: &KeyValueRecord) -> ManifestResult<Self> {
        Ok(Self {
            format_version: record.parse("format_ver")?,
            id: record.parse("uuid")?,
            first: optional_name(record, "first")?,
            last: optional_name(record, "last")?,
            meta_resync: record.parse("meta_resync")?,
        })
    }
}

impl Default for VolumeRecord {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> SessionName {
        s.parse().unwrap()
    }

    #[test]
    fn session_record_roundtrip() {
        let mut rec = SessionRecord::new(name("S_20240101-120000"), 10 << 20, 65536);
        rec.sequence = 4;
        rec.previous = Some(name("S_20231231-120000"));
        let text = rec.to_record().to_string();
        assert!(text.contains("previous = S_20231231-120000\n"));
        assert!(text.contains("format = folders\n"));
        let fields = KeyValueRecord::from_text(&text).unwrap();
        let parsed = SessionRecord::from_record(rec.name, &fields).unwrap();
        assert_eq!(parsed, rec);
    }

    #[test]
    fn first_session_has_no_previous() {
        let rec = SessionRecord::new(name("S_20240101-120000"), 1, 4096);
        assert!(rec.to_record().to_string().contains("previous = none"));
        let parsed = SessionRecord::from_record(rec.name, &rec.to_record()).unwrap();
        assert_eq!(parsed.previous, None);
    }

    #[test]
    fn last_addr_of_session() {
        let rec = SessionRecord::new(name("S_20240101-120000"), 3 * 4096 + 1, 4096);
        assert_eq!(rec.last_addr(), Some(ChunkAddr::new(3 * 4096)));
    }

    #[test]
    fn volume_record_roundtrip() {
        let mut vol = VolumeRecord::new();
        vol.first = Some(name("S_20240101-120000"));
        vol.last = Some(name("S_20240102-120000"));
        vol.meta_resync = true;
        let parsed = VolumeRecord::from_record(&vol.to_record()).unwrap();
        assert_eq!(parsed, vol);
    }

    #[test]
    fn bad_previous_rejected() {
        let mut record = SessionRecord::new(name("S_20240101-120000"), 1, 4096).to_record();
        record.set("previous", "yesterday");
        assert!(matches!(
            SessionRecord::from_record(name("S_20240101-120000"), &record),
            Err(ManifestError::InvalidValue { .. })
        ));
    }
}
