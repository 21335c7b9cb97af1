// Copyright 2023-present The Strom Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! On-disk layout of one storage node volume:
//! `<volume>/cid_<clusterID>/snid_<storageNodeID>/lsid_<logStreamID>/`.

use std::fs;
use std::path::{Path, PathBuf};

use strom_api::{ClusterId, LogStreamId, StorageNodeId};

use crate::{Error, Result};

const CLUSTER_PREFIX: &str = "cid_";
const STORAGE_NODE_PREFIX: &str = "snid_";
const LOG_STREAM_PREFIX: &str = "lsid_";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogStreamPath {
    pub volume: PathBuf,
    pub cluster_id: ClusterId,
    pub storage_node_id: StorageNodeId,
    pub log_stream_id: LogStreamId,
}

pub fn storage_node_dir(
    volume: &Path,
    cluster_id: ClusterId,
    storage_node_id: StorageNodeId,
) -> PathBuf {
    volume
        .join(format!("{CLUSTER_PREFIX}{cluster_id}"))
        .join(format!("{STORAGE_NODE_PREFIX}{storage_node_id}"))
}

pub fn log_stream_dir(
    volume: &Path,
    cluster_id: ClusterId,
    storage_node_id: StorageNodeId,
    log_stream_id: LogStreamId,
) -> PathBuf {
    storage_node_dir(volume, cluster_id, storage_node_id)
        .join(format!("{LOG_STREAM_PREFIX}{log_stream_id}"))
}

/// Create the directory of one log stream replica and return its path.
pub fn create_log_stream_path(
    volume: &Path,
    cluster_id: ClusterId,
    storage_node_id: StorageNodeId,
    log_stream_id: LogStreamId,
) -> Result<PathBuf> {
    let path = log_stream_dir(volume, cluster_id, storage_node_id, log_stream_id);
    fs::create_dir_all(&path)?;
    Ok(path)
}

fn parse_component(component: Option<&std::ffi::OsStr>, prefix: &str) -> Option<u64> {
    component?.to_str()?.strip_prefix(prefix)?.parse().ok()
}

/// Parse `<volume>/cid_<cid>/snid_<snid>/lsid_<lsid>` back into its parts.
pub fn parse_log_stream_path(path: &Path) -> Result<LogStreamPath> {
    let invalid = || Error::InvalidArgument(format!("log stream path {}", path.display()));

    let log_stream_id =
        parse_component(path.file_name(), LOG_STREAM_PREFIX).ok_or_else(invalid)?;
    let sn_dir = path.parent().ok_or_else(invalid)?;
    let storage_node_id =
        parse_component(sn_dir.file_name(), STORAGE_NODE_PREFIX).ok_or_else(invalid)?;
    let cid_dir = sn_dir.parent().ok_or_else(invalid)?;
    let cluster_id = parse_component(cid_dir.file_name(), CLUSTER_PREFIX).ok_or_else(invalid)?;
    let volume = cid_dir.parent().ok_or_else(invalid)?;
    if volume.as_os_str().is_empty() {
        return Err(invalid());
    }

    Ok(LogStreamPath {
        volume: volume.to_path_buf(),
        cluster_id,
        storage_node_id,
        log_stream_id,
    })
}

/// List the log stream replicas stored under one storage node directory.
/// Non-directory children and foreign names are ignored.
pub fn read_log_stream_paths(
    volume: &Path,
    cluster_id: ClusterId,
    storage_node_id: StorageNodeId,
) -> Result<Vec<(LogStreamId, PathBuf)>> {
    let dir = storage_node_dir(volume, cluster_id, storage_node_id);
    let mut paths = Vec::new();
    if !dir.exists() {
        return Ok(paths);
    }
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(log_stream_id) = parse_component(Some(&entry.file_name()), LOG_STREAM_PREFIX)
        else {
            continue;
        };
        paths.push((log_stream_id, entry.path()));
    }
    paths.sort_by_key(|(log_stream_id, _)| *log_stream_id);
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn create_and_parse_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = create_log_stream_path(dir.path(), 1, 2, 3).unwrap();
        assert!(path.is_dir());

        let parsed = parse_log_stream_path(&path).unwrap();
        assert_eq!(parsed.volume, dir.path());
        assert_eq!(parsed.cluster_id, 1);
        assert_eq!(parsed.storage_node_id, 2);
        assert_eq!(parsed.log_stream_id, 3);
    }

    #[test]
    fn parse_rejects_malformed_paths() {
        struct Test {
            tips: &'static str,
            path: &'static str,
        }
        let tests = vec![
            Test { tips: "missing prefix", path: "/vol/cid_1/snid_2/3" },
            Test { tips: "wrong order", path: "/vol/snid_2/cid_1/lsid_3" },
            Test { tips: "non numeric", path: "/vol/cid_1/snid_2/lsid_x" },
            Test { tips: "too short", path: "/cid_1/snid_2/lsid_3" },
        ];
        for Test { tips, path } in tests {
            assert!(parse_log_stream_path(Path::new(path)).is_err(), "{tips}");
        }
    }

    #[test]
    fn walker_ignores_foreign_children() {
        let dir = TempDir::new().unwrap();
        create_log_stream_path(dir.path(), 1, 2, 7).unwrap();
        create_log_stream_path(dir.path(), 1, 2, 3).unwrap();

        let sn_dir = storage_node_dir(dir.path(), 1, 2);
        fs::create_dir(sn_dir.join("not-a-log-stream")).unwrap();
        fs::write(sn_dir.join("lsid_9"), b"a file, not a directory").unwrap();

        let paths = read_log_stream_paths(dir.path(), 1, 2).unwrap();
        let ids: Vec<_> = paths.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![3, 7]);
    }
}
