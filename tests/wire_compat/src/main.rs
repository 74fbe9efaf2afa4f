fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use filedrop_protocol::messages::{
        CompleteUploadRequest, FileEntry, FileResponse, InitUploadRequest, InitUploadResponse,
        LinkFileRequest, PendingSession, PreCheckResponse, UploadResponse,
    };
    use filedrop_protocol::{UploadProgress, UploadStatus};

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    /// Loads a fixture JSON file and returns it as a `serde_json::Value`.
    fn load_fixture(name: &str) -> serde_json::Value {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    fn parse_fixture<T: serde::de::DeserializeOwned>(name: &str) -> T {
        serde_json::from_value(load_fixture(name))
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"))
    }

    /// Deserializes a fixture into a Rust type, re-serializes it, and compares
    /// the JSON values (order-independent).
    fn roundtrip_test<T>(name: &str)
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = serde_json::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));
        assert_eq!(
            fixture, reserialized,
            "roundtrip mismatch for {name}:\n  backend: {fixture}\n  client:  {reserialized}"
        );
    }

    // --- Request bodies the client sends ---

    #[test]
    fn fixture_init_upload_request() {
        roundtrip_test::<InitUploadRequest>("init_upload_request.json");
    }

    #[test]
    fn fixture_complete_upload_request() {
        roundtrip_test::<CompleteUploadRequest>("complete_upload_request.json");
    }

    #[test]
    fn fixture_link_file_request() {
        roundtrip_test::<LinkFileRequest>("link_file_request.json");
    }

    // --- Responses the client reads ---

    #[test]
    fn fixture_init_upload_response() {
        roundtrip_test::<InitUploadResponse>("init_upload_response.json");
        let resp: InitUploadResponse = parse_fixture("init_upload_response.json");
        assert_eq!(resp.chunk_size, 7 * 1024 * 1024);
    }

    #[test]
    fn fixture_upload_response() {
        roundtrip_test::<UploadResponse>("upload_response.json");
    }

    #[test]
    fn fixture_file_response() {
        roundtrip_test::<FileResponse>("file_response.json");
    }

    #[test]
    fn fixture_pre_check_response() {
        roundtrip_test::<PreCheckResponse>("pre_check_response.json");
    }

    #[test]
    fn fixture_pending_sessions() {
        let sessions: Vec<PendingSession> = parse_fixture("pending_sessions.json");
        assert_eq!(sessions.len(), 2);

        let first = &sessions[0];
        assert_eq!(first.total_chunks, 100);
        assert!(first.has_part(4));
        assert!(!first.has_part(3));
        assert!(first.created_at.is_some());

        // Optional fields may be absent entirely.
        let second = &sessions[1];
        assert!(second.uploaded_parts.is_empty());
        assert!(second.file_type.is_none());
        assert!(second.created_at.is_none());
    }

    #[test]
    fn fixture_file_listing_ignores_extra_fields() {
        let entries: Vec<FileEntry> = parse_fixture("file_listing.json");
        assert_eq!(entries.len(), 2);

        assert!(entries[0].is_folder);
        assert_eq!(entries[0].filename, "photos");
        assert!(entries[0].hash.is_none());

        assert!(!entries[1].is_folder);
        assert_eq!(entries[1].size, Some(1204));
        assert_eq!(
            entries[1].hash.as_deref(),
            Some("6c1f0e2d3b4a59687f7e6d5c4b3a2918")
        );
    }

    // --- Snapshot handed to UI layers ---

    #[test]
    fn fixture_upload_progress() {
        roundtrip_test::<UploadProgress>("upload_progress.json");
        let progress: UploadProgress = parse_fixture("upload_progress.json");
        assert_eq!(progress.status, UploadStatus::Uploading);
        assert!(progress.error_message.is_none());
    }
}
