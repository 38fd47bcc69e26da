//! Parsing of a torrent's `.torrent` metainfo file.
//!
//! This is split into a `raw` module that mirrors the bencode dictionary
//! layout exactly, and an outer, processed [`Metainfo`] that turns that raw
//! data into the shapes the rest of the engine wants to work with (an
//! [`FsStructure`](crate::storage_info::FsStructure), a flat piece hash
//! list, tiered trackers, and the info hash).

use sha1::{Digest, Sha1};

use crate::{
    error::{MetainfoError, Result},
    storage_info::FsStructure,
    FileInfo, Sha1Hash,
};

/// The bencode-level structures, deserialized as close to the wire format as
/// `serde_bencode` allows.
pub mod raw {
    #[derive(Debug, Serialize, Deserialize)]
    pub struct Metainfo {
        pub info: Info,
        pub announce: Option<String>,
        #[serde(rename = "announce-list")]
        pub announce_list: Option<Vec<Vec<String>>>,
        pub comment: Option<String>,
        #[serde(rename = "created by")]
        pub created_by: Option<String>,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct Info {
        pub name: String,
        #[serde(with = "serde_bytes")]
        pub pieces: Vec<u8>,
        #[serde(rename = "piece length")]
        pub piece_length: u64,
        pub length: Option<u64>,
        pub files: Option<Vec<File>>,
        pub private: Option<u8>,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct File {
        pub path: Vec<String>,
        pub length: u64,
    }
}

/// A torrent's metainfo, processed into the shape the rest of the engine
/// consumes.
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// The torrent's name, used as the single file's name or as the
    /// directory name for an archive download.
    pub name: String,
    /// The SHA-1 hash of the bencoded info dictionary, uniquely identifying
    /// this torrent.
    pub info_hash: Sha1Hash,
    /// The concatenation of each piece's expected SHA-1 hash.
    pub piece_hashes: Vec<u8>,
    /// The nominal piece length; every piece but the last is this long.
    pub piece_len: u32,
    /// The file(s) that make up this torrent's payload.
    pub structure: FsStructure,
    /// Tiers of trackers to announce to, in the order they should be tried.
    /// Populated from `announce-list` if present, falling back to a single
    /// tier containing `announce`.
    pub trackers: Vec<Vec<String>>,
    /// Whether the torrent is marked private (BEP 27): if true, peers may
    /// only be obtained from the tracker(s), never from DHT or PEX.
    pub private: bool,
}

impl Metainfo {
    /// Parses and validates a torrent file's raw bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, MetainfoError> {
        let raw: raw::Metainfo = serde_bencode::from_bytes(buf)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: raw::Metainfo) -> Result<Self, MetainfoError> {
        let info_bytes = serde_bencode::to_bytes(&raw.info)?;
        let digest = Sha1::digest(&info_bytes);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);

        if raw.info.pieces.len() % 20 != 0 {
            return Err(MetainfoError::InvalidPieceHashesLength);
        }
        if raw.info.pieces.is_empty() {
            return Err(MetainfoError::EmptyTorrent);
        }

        let piece_len = raw.info.piece_length as u32;

        let structure = match (raw.info.length, raw.info.files) {
            (Some(len), None) => {
                if len == 0 {
                    return Err(MetainfoError::EmptyTorrent);
                }
                FsStructure::File(FileInfo {
                    path: raw.info.name.clone().into(),
                    len,
                    torrent_offset: 0,
                })
            }
            (None, Some(files)) => {
                if files.is_empty() {
                    return Err(MetainfoError::EmptyTorrent);
                }
                let mut torrent_offset = 0;
                let files = files
                    .into_iter()
                    .map(|file| {
                        let path = file.path.iter().collect::<std::path::PathBuf>();
                        let info = FileInfo {
                            path,
                            len: file.length,
                            torrent_offset,
                        };
                        torrent_offset += file.length;
                        info
                    })
                    .collect();
                FsStructure::Archive { files }
            }
            _ => return Err(MetainfoError::MissingField("length or files")),
        };

        let trackers = match raw.announce_list {
            Some(tiers) if !tiers.is_empty() => tiers,
            _ => match raw.announce {
                Some(announce) => vec![vec![announce]],
                None => Vec::new(),
            },
        };

        Ok(Self {
            name: raw.info.name,
            info_hash,
            piece_hashes: raw.info.pieces,
            piece_len,
            structure,
            trackers,
            private: raw.info.private.unwrap_or(0) != 0,
        })
    }

    /// The number of pieces in the torrent, derived from the piece hash
    /// list.
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len() / 20
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_raw(raw: &raw::Metainfo) -> Vec<u8> {
        serde_bencode::to_bytes(raw).unwrap()
    }

    #[test]
    fn test_single_file_torrent() {
        let raw = raw::Metainfo {
            info: raw::Info {
                name: "foo.iso".to_string(),
                pieces: vec![0u8; 40],
                piece_length: 1 << 18,
                length: Some(1000),
                files: None,
                private: None,
            },
            announce: Some("http://tracker.example/announce".to_string()),
            announce_list: None,
            comment: None,
            created_by: None,
        };
        let bytes = encode_raw(&raw);
        let metainfo = Metainfo::from_bytes(&bytes).unwrap();
        assert_eq!(metainfo.piece_count(), 2);
        assert!(!metainfo.structure.is_archive());
        assert_eq!(
            metainfo.trackers,
            vec![vec!["http://tracker.example/announce".to_string()]]
        );
    }

    #[test]
    fn test_multi_file_torrent_offsets() {
        let raw = raw::Metainfo {
            info: raw::Info {
                name: "archive".to_string(),
                pieces: vec![0u8; 20],
                piece_length: 1 << 18,
                length: None,
                files: Some(vec![
                    raw::File {
                        path: vec!["a.txt".to_string()],
                        length: 10,
                    },
                    raw::File {
                        path: vec!["sub".to_string(), "b.txt".to_string()],
                        length: 20,
                    },
                ]),
                private: None,
            },
            announce: None,
            announce_list: Some(vec![
                vec!["http://a.example/announce".to_string()],
                vec!["http://b.example/announce".to_string()],
            ]),
            comment: None,
            created_by: None,
        };
        let bytes = encode_raw(&raw);
        let metainfo = Metainfo::from_bytes(&bytes).unwrap();
        assert!(metainfo.structure.is_archive());
        assert_eq!(metainfo.structure.download_len(), 30);
        assert_eq!(metainfo.trackers.len(), 2);
    }

    #[test]
    fn test_rejects_invalid_piece_hash_length() {
        let raw = raw::Metainfo {
            info: raw::Info {
                name: "bad".to_string(),
                pieces: vec![0u8; 19],
                piece_length: 1 << 18,
                length: Some(10),
                files: None,
                private: None,
            },
            announce: None,
            announce_list: None,
            comment: None,
            created_by: None,
        };
        let bytes = encode_raw(&raw);
        assert!(Metainfo::from_bytes(&bytes).is_err());
    }
}
