//! End-to-end tests over a real Unix socket.
//!
//! Each test boots a daemon in a temporary directory and drives it with a
//! minimal protocol client built on the shared codec, the way a browser
//! process would.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixStream;
use tokio::sync::Notify;

use bdp_core::{
    wire, ClientType, CommandCode, Envelope, ErrorCode, KeywordFilter, KeywordScope, SearchQuery,
    TransferMethod,
};
use bdp_daemon::storage::schema::{BlobKind, FIELD_TITLE, FIELD_URL};
use bdp_daemon::{server, DaemonConfig, DaemonContext};

struct Harness {
    _dir: tempfile::TempDir,
    config: DaemonConfig,
    shutdown: Arc<Notify>,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl Harness {
    async fn start(max_sessions: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig {
            socket_path: dir.path().join("provider.sock"),
            data_dir: dir.path().join("data"),
            max_sessions,
            ..DaemonConfig::default()
        };
        let ctx = Arc::new(DaemonContext::init(config.clone()).unwrap());
        let shutdown = Arc::new(Notify::new());
        let task = tokio::spawn(server::serve(ctx, Arc::clone(&shutdown)));

        wait_for_socket(&config.socket_path).await;
        Self { _dir: dir, config, shutdown, task }
    }

    async fn stop(self) {
        self.shutdown.notify_one();
        let _ = self.task.await;
    }
}

async fn wait_for_socket(path: &Path) {
    for _ in 0..200 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("socket {} never appeared", path.display());
}

struct Client {
    stream: UnixStream,
    session_id: u32,
}

impl Client {
    async fn connect(config: &DaemonConfig, client_type: ClientType) -> Self {
        let mut stream = UnixStream::connect(&config.socket_path).await.unwrap();
        wire::write_envelope(&mut stream, &Envelope::new(CommandCode::Connect, 0))
            .await
            .unwrap();
        wire::write_u32(&mut stream, client_type.as_u32()).await.unwrap();
        let status = wire::read_status(&mut stream).await.unwrap();
        assert_eq!(status, ErrorCode::None, "connect refused");
        let session_id = wire::read_u32(&mut stream).await.unwrap();
        assert_ne!(session_id, 0);
        Self { stream, session_id }
    }

    /// Open the dedicated notification connection for this session.
    async fn attach_notify(&self, config: &DaemonConfig) -> UnixStream {
        let mut stream = UnixStream::connect(&config.socket_path).await.unwrap();
        wire::write_envelope(
            &mut stream,
            &Envelope::new(CommandCode::AttachNotify, self.session_id),
        )
        .await
        .unwrap();
        assert_eq!(wire::read_status(&mut stream).await.unwrap(), ErrorCode::None);
        stream
    }

    async fn simple(&mut self, command: CommandCode) -> ErrorCode {
        wire::write_envelope(&mut self.stream, &Envelope::new(command, self.session_id))
            .await
            .unwrap();
        wire::read_status(&mut self.stream).await.unwrap()
    }

    async fn create(&mut self, requested: i64) -> i64 {
        wire::write_envelope(
            &mut self.stream,
            &Envelope::with_record(CommandCode::CreateRecord, self.session_id, requested),
        )
        .await
        .unwrap();
        assert_eq!(wire::read_status(&mut self.stream).await.unwrap(), ErrorCode::None);
        wire::read_i64(&mut self.stream).await.unwrap()
    }

    async fn id_list(&mut self, command: CommandCode) -> Vec<i64> {
        wire::write_envelope(&mut self.stream, &Envelope::new(command, self.session_id))
            .await
            .unwrap();
        assert_eq!(wire::read_status(&mut self.stream).await.unwrap(), ErrorCode::None);
        wire::read_id_list(&mut self.stream).await.unwrap()
    }

    async fn set_string(&mut self, id: i64, field: u32, value: &str) -> ErrorCode {
        wire::write_envelope(
            &mut self.stream,
            &Envelope::with_record(CommandCode::SetString, self.session_id, id),
        )
        .await
        .unwrap();
        wire::write_u32(&mut self.stream, field).await.unwrap();
        wire::write_string(&mut self.stream, value).await.unwrap();
        wire::read_status(&mut self.stream).await.unwrap()
    }

    async fn find_ids(&mut self, query: &SearchQuery) -> Vec<i64> {
        wire::write_envelope(
            &mut self.stream,
            &Envelope::new(CommandCode::FindIds, self.session_id),
        )
        .await
        .unwrap();
        query.write_to(&mut self.stream).await.unwrap();
        assert_eq!(wire::read_status(&mut self.stream).await.unwrap(), ErrorCode::None);
        wire::read_id_list(&mut self.stream).await.unwrap()
    }

    async fn set_blob(
        &mut self,
        id: i64,
        kind: BlobKind,
        width: i32,
        height: i32,
        bytes: &[u8],
        via_shm: bool,
    ) -> (TransferMethod, ErrorCode) {
        wire::write_envelope(
            &mut self.stream,
            &Envelope::with_record(CommandCode::SetBlob, self.session_id, id),
        )
        .await
        .unwrap();
        wire::write_u32(&mut self.stream, kind as u32).await.unwrap();
        wire::write_i32(&mut self.stream, width).await.unwrap();
        wire::write_i32(&mut self.stream, height).await.unwrap();
        wire::write_u32(&mut self.stream, bytes.len() as u32).await.unwrap();
        wire::write_u32(&mut self.stream, u32::from(via_shm)).await.unwrap();
        assert_eq!(wire::read_status(&mut self.stream).await.unwrap(), ErrorCode::None);
        let method =
            TransferMethod::from_u32(wire::read_u32(&mut self.stream).await.unwrap()).unwrap();
        match method {
            TransferMethod::Inline => {
                wire::write_blob_body(&mut self.stream, bytes).await.unwrap();
            }
            TransferMethod::SharedMemory => {
                let mut segment =
                    bdp_daemon::shm::ShmChannel::open_existing(self.session_id, bytes.len())
                        .unwrap();
                segment.write(bytes).unwrap();
                wire::write_u32(&mut self.stream, 1).await.unwrap();
            }
        }
        (method, wire::read_status(&mut self.stream).await.unwrap())
    }

    async fn get_blob(
        &mut self,
        id: i64,
        kind: BlobKind,
        accept_shm: bool,
    ) -> (TransferMethod, i32, i32, Vec<u8>) {
        wire::write_envelope(
            &mut self.stream,
            &Envelope::with_record(CommandCode::GetBlob, self.session_id, id),
        )
        .await
        .unwrap();
        wire::write_u32(&mut self.stream, kind as u32).await.unwrap();
        wire::write_u32(&mut self.stream, u32::from(accept_shm)).await.unwrap();
        assert_eq!(wire::read_status(&mut self.stream).await.unwrap(), ErrorCode::None);
        let method =
            TransferMethod::from_u32(wire::read_u32(&mut self.stream).await.unwrap()).unwrap();
        let width = wire::read_i32(&mut self.stream).await.unwrap();
        let height = wire::read_i32(&mut self.stream).await.unwrap();
        let len = wire::read_u32(&mut self.stream).await.unwrap() as usize;
        let bytes = match method {
            TransferMethod::Inline => wire::read_blob_body(&mut self.stream, len).await.unwrap(),
            TransferMethod::SharedMemory => {
                let segment =
                    bdp_daemon::shm::ShmChannel::open_existing(self.session_id, len).unwrap();
                segment.read_copy(len).unwrap()
            }
        };
        (method, width, height, bytes)
    }
}

#[tokio::test]
async fn bookmark_lifecycle_over_the_socket() {
    let harness = Harness::start(30).await;
    let mut client = Client::connect(&harness.config, ClientType::Bookmark).await;

    let id = client.create(-1).await;
    assert!(id > 0);
    assert_eq!(client.id_list(CommandCode::GetFullIds).await, vec![id]);
    // New records are born dirty for the next sync pass.
    assert_eq!(client.id_list(CommandCode::GetDirtyIds).await, vec![id]);

    assert_eq!(client.simple(CommandCode::ClearDirtyIds).await, ErrorCode::None);
    assert!(client.id_list(CommandCode::GetDirtyIds).await.is_empty());

    assert_eq!(
        client.set_string(id, FIELD_TITLE, "The Rust Programming Language").await,
        ErrorCode::None
    );
    assert_eq!(
        client.set_string(id, FIELD_URL, "https://www.rust-lang.org/learn").await,
        ErrorCode::None
    );
    // The title edit re-dirtied the record.
    assert_eq!(client.id_list(CommandCode::GetDirtyIds).await, vec![id]);

    // Keyword search, normalized: the bare fragment matches the stored
    // https/www URL.
    let query = SearchQuery {
        keyword: Some(KeywordFilter {
            keyword: "rust-lang.org%".to_owned(),
            scope: KeywordScope::TitleOrUrl,
            raw: false,
        }),
        ..SearchQuery::default()
    };
    assert_eq!(client.find_ids(&query).await, vec![id]);

    assert_eq!(client.simple(CommandCode::Disconnect).await, ErrorCode::None);
    harness.stop().await;
}

#[tokio::test]
async fn change_marker_reaches_the_sync_listener() {
    let harness = Harness::start(30).await;
    let mut writer = Client::connect(&harness.config, ClientType::Bookmark).await;
    let mut listener = Client::connect(&harness.config, ClientType::BookmarkSync).await;

    let mut notify_stream = listener.attach_notify(&harness.config).await;
    assert_eq!(listener.simple(CommandCode::SetNotifyCallback).await, ErrorCode::None);

    writer.create(-1).await;
    assert_eq!(writer.simple(CommandCode::NotifyChange).await, ErrorCode::None);

    let marker = tokio::time::timeout(
        Duration::from_secs(5),
        wire::read_u32(&mut notify_stream),
    )
    .await
    .expect("no marker within five seconds")
    .unwrap();
    assert_eq!(marker, CommandCode::NotifyChange.as_u32());
    harness.stop().await;
}

#[tokio::test]
async fn unsubscribed_listener_gets_no_marker() {
    let harness = Harness::start(30).await;
    let mut writer = Client::connect(&harness.config, ClientType::History).await;
    let listener = Client::connect(&harness.config, ClientType::HistorySync).await;

    let mut notify_stream = listener.attach_notify(&harness.config).await;
    // No SetNotifyCallback: the channel stays silent.
    assert_eq!(writer.simple(CommandCode::NotifyChange).await, ErrorCode::None);

    let outcome =
        tokio::time::timeout(Duration::from_millis(300), wire::read_u32(&mut notify_stream)).await;
    assert!(outcome.is_err(), "marker delivered without a registered callback");
    harness.stop().await;
}

#[tokio::test]
async fn blob_round_trips_through_shared_memory() {
    let harness = Harness::start(30).await;
    let mut client = Client::connect(&harness.config, ClientType::Bookmark).await;
    let id = client.create(-1).await;
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

    let (method, status) =
        client.set_blob(id, BlobKind::Thumbnail, 640, 480, &payload, true).await;
    assert_eq!(method, TransferMethod::SharedMemory);
    assert_eq!(status, ErrorCode::None);

    let (method, width, height, bytes) = client.get_blob(id, BlobKind::Thumbnail, true).await;
    assert_eq!(method, TransferMethod::SharedMemory);
    assert_eq!((width, height), (640, 480));
    assert_eq!(bytes, payload);

    // The same bytes are also served inline when the client opts out.
    let (method, _, _, bytes) = client.get_blob(id, BlobKind::Thumbnail, false).await;
    assert_eq!(method, TransferMethod::Inline);
    assert_eq!(bytes, payload);
    harness.stop().await;
}

#[tokio::test]
async fn inline_fallback_round_trips() {
    let harness = Harness::start(30).await;
    let mut client = Client::connect(&harness.config, ClientType::History).await;
    let id = client.create(-1).await;
    let payload = vec![0x5Au8; 4096];

    let (method, status) =
        client.set_blob(id, BlobKind::Favicon, 32, 32, &payload, false).await;
    assert_eq!(method, TransferMethod::Inline);
    assert_eq!(status, ErrorCode::None);

    let (method, _, _, bytes) = client.get_blob(id, BlobKind::Favicon, false).await;
    assert_eq!(method, TransferMethod::Inline);
    assert_eq!(bytes, payload);
    harness.stop().await;
}

#[tokio::test]
async fn oversized_blob_falls_back_to_inline_despite_shm_request() {
    let harness = Harness::start(30).await;
    let mut client = Client::connect(&harness.config, ClientType::SavedPage).await;
    let id = client.create(-1).await;
    // One byte past the segment ceiling: both sides ask for shared memory
    // and both must settle on the socket instead.
    let len = bdp_daemon::shm::MAX_SEGMENT_LEN + 1;
    let payload: Vec<u8> = (0..len).map(|i| (i % 239) as u8).collect();

    let (method, status) =
        client.set_blob(id, BlobKind::Thumbnail, 1920, 1080, &payload, true).await;
    assert_eq!(method, TransferMethod::Inline);
    assert_eq!(status, ErrorCode::None);

    let (method, width, height, bytes) = client.get_blob(id, BlobKind::Thumbnail, true).await;
    assert_eq!(method, TransferMethod::Inline);
    assert_eq!((width, height), (1920, 1080));
    assert_eq!(bytes, payload);
    harness.stop().await;
}

#[tokio::test]
async fn full_table_evicts_the_idle_session() {
    let harness = Harness::start(1).await;
    let mut first = Client::connect(&harness.config, ClientType::Bookmark).await;
    first.create(-1).await;

    // Second connect takes the only slot; the first session is cancelled.
    let mut second = Client::connect(&harness.config, ClientType::History).await;
    second.create(-1).await;

    let eof = tokio::time::timeout(
        Duration::from_secs(5),
        wire::read_envelope(&mut first.stream),
    )
    .await
    .expect("evicted session was not closed");
    assert!(eof.is_err(), "evicted session still received data");

    // The survivor keeps working.
    assert_eq!(second.id_list(CommandCode::GetFullIds).await.len(), 1);
    harness.stop().await;
}

#[tokio::test]
async fn sessions_are_isolated_per_domain() {
    let harness = Harness::start(30).await;
    let mut bookmarks = Client::connect(&harness.config, ClientType::Bookmark).await;
    let mut tabs = Client::connect(&harness.config, ClientType::Tab).await;

    bookmarks.create(-1).await;
    bookmarks.create(-1).await;
    tabs.create(-1).await;

    assert_eq!(bookmarks.id_list(CommandCode::GetFullIds).await.len(), 2);
    assert_eq!(tabs.id_list(CommandCode::GetFullIds).await.len(), 1);
    harness.stop().await;
}

#[tokio::test]
async fn unknown_client_type_is_refused() {
    let harness = Harness::start(30).await;
    let mut stream = UnixStream::connect(&harness.config.socket_path).await.unwrap();
    wire::write_envelope(&mut stream, &Envelope::new(CommandCode::Connect, 0))
        .await
        .unwrap();
    wire::write_u32(&mut stream, 0xDEAD).await.unwrap();
    assert_eq!(
        wire::read_status(&mut stream).await.unwrap(),
        ErrorCode::InvalidParameter
    );
    harness.stop().await;
}

#[tokio::test]
async fn first_envelope_must_be_a_handshake() {
    let harness = Harness::start(30).await;
    let mut stream = UnixStream::connect(&harness.config.socket_path).await.unwrap();
    wire::write_envelope(&mut stream, &Envelope::new(CommandCode::GetFullIds, 0))
        .await
        .unwrap();
    assert_eq!(
        wire::read_status(&mut stream).await.unwrap(),
        ErrorCode::InvalidParameter
    );
    harness.stop().await;
}
