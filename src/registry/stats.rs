//! Registry snapshot for the stats command.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use super::record::{ServerRecord, SESSION_FIELD};

/// Fields never shown in stats output.
const REDACTED: [&str; 4] = ["publicip", SESSION_FIELD, "localip0", "localip1"];

/// JSON view of the registry with addressing fields removed.
pub fn snapshot(games: &BTreeMap<String, Vec<ServerRecord>>, now: DateTime<Utc>) -> Value {
    let mut total = 0;
    let mut out = serde_json::Map::new();

    for (game_id, servers) in games {
        total += servers.len();
        let servers: Vec<Value> = servers
            .iter()
            .map(|record| {
                let mut record = record.clone();
                for name in REDACTED {
                    record.remove(name);
                }
                record.to_json()
            })
            .collect();

        out.insert(
            game_id.clone(),
            json!({
                "count": servers.len(),
                "servers": servers,
            }),
        );
    }

    json!({
        "generated_at": now.to_rfc3339(),
        "total": total,
        "games": out,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_snapshot_redacts_addresses() {
        let mut record = ServerRecord::from_pairs([
            ("hostname", "room"),
            ("publicip", "12345"),
            ("localip0", "10.0.0.2"),
            ("localip1", "10.0.0.3"),
        ]);
        record.set(SESSION_FIELD, 99);

        let mut games = BTreeMap::new();
        games.insert("mariokartwii".to_string(), vec![record]);
        games.insert("empty".to_string(), Vec::new());

        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let value = snapshot(&games, now);

        assert_eq!(value["total"], 1);
        assert_eq!(value["games"]["empty"]["count"], 0);
        let server = &value["games"]["mariokartwii"]["servers"][0];
        assert_eq!(server["hostname"], "room");
        assert!(server.get("publicip").is_none());
        assert!(server.get("localip0").is_none());
        assert!(server.get("localip1").is_none());
        assert!(server.get(SESSION_FIELD).is_none());
        assert!(value["generated_at"].as_str().unwrap().starts_with("2024-05-01T12:00:00"));
    }
}
