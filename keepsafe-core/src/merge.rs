//! Last-write-wins reconciliation of two record sets.
//!
//! The merge is a pure function: no clock, no I/O, no logging. Given the
//! client's and the server's records for one user it produces the merged
//! set plus the two work lists that drive out-of-band file transfers.

use std::collections::HashMap;

use crate::model::DataItem;
use crate::{Error, Result};

/// Which side wins when `updated_at` is exactly equal.
///
/// The canonical rule is [`TieBreak::Server`]: client clocks may skew,
/// so the server copy is treated as authoritative. Ties never populate
/// a work list either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieBreak {
    Client,
    Server,
}

/// Result of reconciling a client and a server record set.
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    /// One winner per id across both inputs. Unordered.
    pub merged: Vec<DataItem>,
    /// Client records the server is missing or holds a stale copy of.
    pub upload_list: Vec<DataItem>,
    /// Server records the client is missing or holds a stale copy of.
    pub download_list: Vec<DataItem>,
}

/// Merge with the canonical tie-break (server wins on equal timestamps).
pub fn merge(client: &[DataItem], server: &[DataItem]) -> Result<MergeOutcome> {
    merge_with(client, server, TieBreak::Server)
}

/// Merge with an explicit tie-break role.
pub fn merge_with(
    client: &[DataItem],
    server: &[DataItem],
    tie: TieBreak,
) -> Result<MergeOutcome> {
    let client_map = index_by_id(client, "client")?;
    let server_map = index_by_id(server, "server")?;

    let mut outcome = MergeOutcome::default();

    for (id, c) in &client_map {
        match server_map.get(id) {
            None => {
                outcome.merged.push((*c).clone());
                outcome.upload_list.push((*c).clone());
            }
            Some(s) => {
                if c.updated_at > s.updated_at {
                    outcome.merged.push((*c).clone());
                    outcome.upload_list.push((*c).clone());
                } else if s.updated_at > c.updated_at {
                    outcome.merged.push((*s).clone());
                    outcome.download_list.push((*s).clone());
                } else {
                    let winner = match tie {
                        TieBreak::Server => s,
                        TieBreak::Client => c,
                    };
                    outcome.merged.push((*winner).clone());
                }
            }
        }
    }

    for (id, s) in &server_map {
        if !client_map.contains_key(id) {
            outcome.merged.push((*s).clone());
            outcome.download_list.push((*s).clone());
        }
    }

    Ok(outcome)
}

fn index_by_id<'a>(
    items: &'a [DataItem],
    side: &str,
) -> Result<HashMap<&'a str, &'a DataItem>> {
    let mut map = HashMap::with_capacity(items.len());
    for item in items {
        if map.insert(item.id.as_str(), item).is_some() {
            return Err(Error::MalformedInput(format!(
                "duplicate id {:?} in {side} records",
                item.id
            )));
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DataKind;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
    }

    fn item(id: &str, content: &str, updated_at: DateTime<Utc>) -> DataItem {
        DataItem {
            id: id.into(),
            kind: DataKind::Text,
            content: content.into(),
            meta: String::new(),
            user_id: String::new(),
            updated_at,
        }
    }

    fn sorted_by_id(mut items: Vec<DataItem>) -> Vec<DataItem> {
        items.sort_by(|a, b| a.id.cmp(&b.id));
        items
    }

    fn ids(items: &[DataItem]) -> Vec<&str> {
        let mut ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        ids.sort_unstable();
        ids
    }

    #[test]
    fn empty_inputs_produce_empty_outputs() {
        let outcome = merge(&[], &[]).unwrap();
        assert!(outcome.merged.is_empty());
        assert!(outcome.upload_list.is_empty());
        assert!(outcome.download_list.is_empty());
    }

    #[test]
    fn client_only_record_is_scheduled_for_upload() {
        let client = vec![item("a", "hi", at(0))];
        let outcome = merge(&client, &[]).unwrap();
        assert_eq!(ids(&outcome.merged), ["a"]);
        assert_eq!(ids(&outcome.upload_list), ["a"]);
        assert!(outcome.download_list.is_empty());
    }

    #[test]
    fn server_only_record_is_scheduled_for_download() {
        let server = vec![item("a", "hi", at(0))];
        let outcome = merge(&[], &server).unwrap();
        assert_eq!(ids(&outcome.merged), ["a"]);
        assert!(outcome.upload_list.is_empty());
        assert_eq!(ids(&outcome.download_list), ["a"]);
    }

    #[test]
    fn newer_server_copy_wins_and_downloads() {
        let client = vec![item("a", "old", at(10))];
        let server = vec![item("a", "new", at(11))];
        let outcome = merge(&client, &server).unwrap();
        assert_eq!(outcome.merged.len(), 1);
        assert_eq!(outcome.merged[0].content, "new");
        assert!(outcome.upload_list.is_empty());
        assert_eq!(ids(&outcome.download_list), ["a"]);
    }

    #[test]
    fn newer_client_copy_wins_and_uploads() {
        let client = vec![item("a", "new", at(11))];
        let server = vec![item("a", "old", at(10))];
        let outcome = merge(&client, &server).unwrap();
        assert_eq!(outcome.merged[0].content, "new");
        assert_eq!(ids(&outcome.upload_list), ["a"]);
        assert!(outcome.download_list.is_empty());
    }

    #[test]
    fn equal_timestamps_keep_server_copy_and_schedule_nothing() {
        let client = vec![item("a", "client version", at(10))];
        let server = vec![item("a", "server version", at(10))];
        let outcome = merge(&client, &server).unwrap();
        assert_eq!(outcome.merged[0].content, "server version");
        assert!(outcome.upload_list.is_empty());
        assert!(outcome.download_list.is_empty());
    }

    #[test]
    fn epoch_timestamps_participate_normally() {
        let epoch = Utc.timestamp_opt(0, 0).unwrap();
        let client = vec![item("a", "ancient", epoch)];
        let server = vec![item("a", "recent", at(1))];
        let outcome = merge(&client, &server).unwrap();
        assert_eq!(outcome.merged[0].content, "recent");
        assert_eq!(ids(&outcome.download_list), ["a"]);
    }

    #[test]
    fn duplicate_ids_in_one_input_are_rejected() {
        let client = vec![item("a", "one", at(1)), item("a", "two", at(2))];
        let err = merge(&client, &[]).unwrap_err();
        assert!(matches!(err, Error::MalformedInput(_)));

        let server = vec![item("b", "one", at(1)), item("b", "two", at(2))];
        let err = merge(&[], &server).unwrap_err();
        assert!(matches!(err, Error::MalformedInput(_)));
    }

    #[test]
    fn merged_set_is_commutative_under_swapped_roles() {
        let a = vec![
            item("a", "a@1", at(1)),
            item("b", "b@5", at(5)),
            item("tie", "a side", at(3)),
        ];
        let b = vec![
            item("b", "b@2", at(2)),
            item("c", "c@4", at(4)),
            item("tie", "b side", at(3)),
        ];

        // merge(A, B) breaks ties toward B; merging with the roles
        // swapped must break ties toward B as well for the sets to match.
        let ab = merge_with(&a, &b, TieBreak::Server).unwrap();
        let ba = merge_with(&b, &a, TieBreak::Client).unwrap();
        assert_eq!(sorted_by_id(ab.merged), sorted_by_id(ba.merged));
    }

    #[test]
    fn merge_is_idempotent_against_its_own_output() {
        let a = vec![item("a", "a@2", at(2)), item("b", "b@1", at(1))];
        let b = vec![item("b", "b@3", at(3)), item("c", "c@1", at(1))];

        let first = merge(&a, &b).unwrap();
        let second = merge(&a, &first.merged).unwrap();
        assert_eq!(
            sorted_by_id(first.merged),
            sorted_by_id(second.merged)
        );
    }

    #[test]
    fn winner_timestamp_is_the_maximum_per_id() {
        let a = vec![item("x", "a", at(7)), item("y", "a", at(2))];
        let b = vec![item("x", "b", at(3)), item("y", "b", at(9))];
        let outcome = merge(&a, &b).unwrap();
        for item in &outcome.merged {
            let expected = match item.id.as_str() {
                "x" => at(7),
                "y" => at(9),
                other => panic!("unexpected id {other}"),
            };
            assert_eq!(item.updated_at, expected);
        }
    }

    #[test]
    fn work_lists_are_sound_and_disjoint() {
        let client = vec![
            item("client-new", "c", at(5)),
            item("client-fresh", "c", at(8)),
            item("server-fresh", "c", at(1)),
            item("tied", "c", at(4)),
        ];
        let server = vec![
            item("server-new", "s", at(5)),
            item("client-fresh", "s", at(2)),
            item("server-fresh", "s", at(6)),
            item("tied", "s", at(4)),
        ];
        let outcome = merge(&client, &server).unwrap();

        assert_eq!(ids(&outcome.upload_list), ["client-fresh", "client-new"]);
        assert_eq!(ids(&outcome.download_list), ["server-fresh", "server-new"]);

        // Every upload winner is the client copy, every download winner
        // the server copy, as recorded in the merged set.
        let merged: std::collections::HashMap<&str, &DataItem> = outcome
            .merged
            .iter()
            .map(|i| (i.id.as_str(), i))
            .collect();
        for up in &outcome.upload_list {
            assert_eq!(merged[up.id.as_str()].content, up.content);
        }
        for down in &outcome.download_list {
            assert_eq!(merged[down.id.as_str()].content, down.content);
        }

        // Disjoint by construction.
        for up in &outcome.upload_list {
            assert!(!outcome.download_list.iter().any(|d| d.id == up.id));
        }
    }

    #[test]
    fn every_changed_id_appears_in_exactly_one_work_list() {
        let client = vec![
            item("only-client", "c", at(1)),
            item("both-client-wins", "c", at(9)),
            item("both-server-wins", "c", at(1)),
            item("both-tied", "c", at(5)),
        ];
        let server = vec![
            item("only-server", "s", at(1)),
            item("both-client-wins", "s", at(2)),
            item("both-server-wins", "s", at(8)),
            item("both-tied", "s", at(5)),
        ];
        let outcome = merge(&client, &server).unwrap();

        let mut listed = ids(&outcome.upload_list);
        listed.extend(ids(&outcome.download_list));
        listed.sort_unstable();
        assert_eq!(
            listed,
            [
                "both-client-wins",
                "both-server-wins",
                "only-client",
                "only-server"
            ]
        );
    }

    #[test]
    fn merged_covers_the_union_of_ids() {
        let client = vec![item("a", "c", at(1)), item("b", "c", at(2))];
        let server = vec![item("b", "s", at(3)), item("c", "s", at(4))];
        let outcome = merge(&client, &server).unwrap();
        assert_eq!(ids(&outcome.merged), ["a", "b", "c"]);
    }
}
