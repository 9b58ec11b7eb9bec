// ABOUTME: Process table of spawned daemons (host, rank, pid per unit).
// ABOUTME: Built once after launch and shared by value with the transport and daemons.

use std::collections::HashSet;
use std::io::{self, Write};

use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

/// Placement record for one spawned daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessTableEntry {
    /// Host the daemon runs on.
    pub host: String,
    /// Rank of the target process this daemon serves.
    pub rank: u32,
    /// Process id of the daemon.
    pub pid: u32,
    /// Rank in the MPI world, when the target job is an MPI job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mpi_rank: Option<u32>,
}

impl ProcessTableEntry {
    pub fn new(host: impl Into<String>, rank: u32, pid: u32) -> Self {
        Self {
            host: host.into(),
            rank,
            pid,
            mpi_rank: None,
        }
    }

    /// Attach the MPI world rank.
    pub fn with_mpi_rank(mut self, mpi_rank: u32) -> Self {
        self.mpi_rank = Some(mpi_rank);
        self
    }
}

/// Ordered, immutable collection of daemon placements, unique by (host, pid).
///
/// There are no mutating methods: every reader gets a value, never a shared
/// map. Cloning is how the table is handed to the transport and to daemons.
/// Deserialized tables go through [`ProcessTable::populate`] as well.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawProcessTable")]
pub struct ProcessTable {
    entries: Vec<ProcessTableEntry>,
}

#[derive(Deserialize)]
struct RawProcessTable {
    entries: Vec<ProcessTableEntry>,
}

impl TryFrom<RawProcessTable> for ProcessTable {
    type Error = ProtoError;

    fn try_from(raw: RawProcessTable) -> Result<Self, Self::Error> {
        Self::populate(raw.entries)
    }
}

impl ProcessTable {
    /// Populate a table from the entries the launch service enumerated.
    ///
    /// Fails with [`ProtoError::PopulationFailed`] when nothing was enumerated
    /// and with [`ProtoError::DuplicateEntry`] when (host, pid) repeats.
    pub fn populate<I>(entries: I) -> Result<Self, ProtoError>
    where
        I: IntoIterator<Item = ProcessTableEntry>,
    {
        let entries: Vec<ProcessTableEntry> = entries.into_iter().collect();
        if entries.is_empty() {
            return Err(ProtoError::PopulationFailed(
                "launch service reported no daemons".to_string(),
            ));
        }

        let mut seen = HashSet::with_capacity(entries.len());
        for entry in &entries {
            if !seen.insert((entry.host.as_str(), entry.pid)) {
                return Err(ProtoError::DuplicateEntry {
                    host: entry.host.clone(),
                    pid: entry.pid,
                });
            }
        }

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ProcessTableEntry] {
        &self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ProcessTableEntry> {
        self.entries.iter()
    }

    /// Find the entry for a target rank.
    pub fn by_rank(&self, rank: u32) -> Option<&ProcessTableEntry> {
        self.entries.iter().find(|e| e.rank == rank)
    }

    /// Distinct hosts, in first-seen order.
    pub fn hosts(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .map(|e| e.host.as_str())
            .filter(|h| seen.insert(*h))
            .collect()
    }

    /// Write a human-readable listing, one line per entry.
    pub fn dump<W: Write>(&self, out: &mut W, prefix: &str) -> io::Result<()> {
        for entry in &self.entries {
            write!(
                out,
                "{prefix}host={} rank={} pid={}",
                entry.host, entry.rank, entry.pid
            )?;
            if let Some(mpi_rank) = entry.mpi_rank {
                write!(out, " mpi_rank={mpi_rank}")?;
            }
            writeln!(out)?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a ProcessTable {
    type Item = &'a ProcessTableEntry;
    type IntoIter = std::slice::Iter<'a, ProcessTableEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn four_units() -> Vec<ProcessTableEntry> {
        vec![
            ProcessTableEntry::new("node01", 0, 1100),
            ProcessTableEntry::new("node01", 1, 1101),
            ProcessTableEntry::new("node02", 2, 1100),
            ProcessTableEntry::new("node02", 3, 1101),
        ]
    }

    #[test]
    fn test_populate_keeps_order() {
        let table = ProcessTable::populate(four_units()).unwrap();
        assert_eq!(table.len(), 4);
        let ranks: Vec<u32> = table.iter().map(|e| e.rank).collect();
        assert_eq!(ranks, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_same_pid_on_different_hosts_is_unique() {
        // node01/1100 and node02/1100 are distinct daemons
        let table = ProcessTable::populate(four_units()).unwrap();
        assert_eq!(table.hosts(), vec!["node01", "node02"]);
    }

    #[test]
    fn test_populate_empty_fails() {
        let result = ProcessTable::populate(Vec::new());
        assert!(matches!(result, Err(ProtoError::PopulationFailed(_))));
    }

    #[test]
    fn test_populate_duplicate_fails() {
        let mut entries = four_units();
        entries.push(ProcessTableEntry::new("node02", 9, 1101));
        let err = ProcessTable::populate(entries).unwrap_err();
        assert_eq!(
            err,
            ProtoError::DuplicateEntry {
                host: "node02".to_string(),
                pid: 1101
            }
        );
    }

    #[test]
    fn test_by_rank() {
        let table = ProcessTable::populate(four_units()).unwrap();
        assert_eq!(table.by_rank(2).unwrap().host, "node02");
        assert!(table.by_rank(7).is_none());
    }

    #[test]
    fn test_dump_one_line_per_entry() {
        let entries = vec![
            ProcessTableEntry::new("node01", 0, 10).with_mpi_rank(0),
            ProcessTableEntry::new("node02", 1, 11),
        ];
        let table = ProcessTable::populate(entries).unwrap();

        let mut out = Vec::new();
        table.dump(&mut out, "[pstep] ").unwrap();
        let text = String::from_utf8(out).unwrap();

        assert_eq!(
            text,
            "[pstep] host=node01 rank=0 pid=10 mpi_rank=0\n[pstep] host=node02 rank=1 pid=11\n"
        );
    }

    #[test]
    fn test_clone_is_independent_value() {
        let table = ProcessTable::populate(four_units()).unwrap();
        let copy = table.clone();
        drop(table);
        assert_eq!(copy.len(), 4);
    }

    #[test]
    fn test_serde_shape() {
        let table = ProcessTable::populate(vec![ProcessTableEntry::new("n", 0, 1)]).unwrap();
        let json = serde_json::to_string(&table).unwrap();
        assert_eq!(json, r#"{"entries":[{"host":"n","rank":0,"pid":1}]}"#);
        let back: ProcessTable = serde_json::from_str(&json).unwrap();
        assert_eq!(back, table);
    }

    #[test]
    fn test_deserialize_rejects_duplicates() {
        let json = r#"{"entries":[{"host":"n","rank":0,"pid":1},{"host":"n","rank":1,"pid":1}]}"#;
        let err = serde_json::from_str::<ProcessTable>(json).unwrap_err();
        assert!(err.to_string().contains("duplicate"), "{err}");
    }

    #[test]
    fn test_deserialize_rejects_empty() {
        assert!(serde_json::from_str::<ProcessTable>(r#"{"entries":[]}"#).is_err());
    }
}
