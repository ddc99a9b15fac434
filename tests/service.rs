//! End-to-end tests of the task manager with in-process fakes for the PDF
//! engine, the vision model and the webhook endpoint.

use async_trait::async_trait;
use chrono::Utc;
use edgequake_md_service::pipeline::annotate::locators;
use edgequake_md_service::store::TaskStore;
use edgequake_md_service::{
    DeliveryReport, DescribeContext, DescribeError, ImageDescriber, JobStatus, Notifier,
    PdfBackend, RawDocument, RawPage, ServiceConfig, ServiceError, Task, TaskId, TaskManager,
    TaskState, Upload, WebhookPayload,
};
use image::{DynamicImage, Rgba, RgbaImage};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ── Fakes ────────────────────────────────────────────────────────────────

/// Serves the same page layout for every document: `(text, image count)`.
struct FakePdf {
    pages: Vec<(&'static str, usize)>,
    hold: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl FakePdf {
    fn new(pages: Vec<(&'static str, usize)>) -> Arc<Self> {
        Self::holding(pages, Duration::ZERO)
    }

    fn holding(pages: Vec<(&'static str, usize)>, hold: Duration) -> Arc<Self> {
        Arc::new(Self {
            pages,
            hold,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }
}

impl PdfBackend for FakePdf {
    fn load(&self, _bytes: Vec<u8>) -> Result<RawDocument, ServiceError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(self.hold);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.pages.is_empty() {
            return Err(ServiceError::Conversion {
                detail: "unparsable PDF".into(),
            });
        }
        let pages = self
            .pages
            .iter()
            .map(|(text, n)| RawPage {
                text: text.to_string(),
                images: (0..*n)
                    .map(|i| {
                        let shade = 40 * i as u8;
                        DynamicImage::ImageRgba8(RgbaImage::from_pixel(2, 2, Rgba([shade, 0, 0, 255])))
                    })
                    .collect(),
            })
            .collect();
        Ok(RawDocument { pages })
    }
}

/// Loses the whole task tree while the document is being parsed, the way a
/// wiped volume would.
struct VanishingStorage {
    tasks_dir: PathBuf,
}

impl PdfBackend for VanishingStorage {
    fn load(&self, _bytes: Vec<u8>) -> Result<RawDocument, ServiceError> {
        let _ = std::fs::remove_dir_all(&self.tasks_dir);
        Ok(RawDocument {
            pages: vec![RawPage {
                text: "Lost page".into(),
                images: Vec::new(),
            }],
        })
    }
}

#[derive(Default)]
struct FakeDescriber {
    fail: bool,
    delay: Duration,
    gate: Option<CancellationToken>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl ImageDescriber for FakeDescriber {
    async fn describe(&self, image: &[u8], _context: &DescribeContext) -> Result<String, DescribeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if let Some(ref gate) = self.gate {
            gate.cancelled().await;
        }
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail {
            Err(DescribeError::Transient {
                detail: "503 Service Unavailable".into(),
            })
        } else if image.is_empty() {
            Err(DescribeError::Permanent {
                detail: "empty image".into(),
            })
        } else {
            Ok("A bar chart".into())
        }
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<(String, WebhookPayload)>>,
}

impl RecordingNotifier {
    fn payloads_for(&self, id: TaskId) -> Vec<WebhookPayload> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, p)| p.task_id == id)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, url: &str, payload: &WebhookPayload) -> DeliveryReport {
        self.sent
            .lock()
            .unwrap()
            .push((url.to_string(), payload.clone()));
        DeliveryReport {
            attempts: 1,
            delivered: true,
            last_status: Some(200),
            last_attempt_at: Some(Utc::now()),
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

const HOOK: &str = "https://hooks.example.com/md";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config(tmp: &TempDir) -> ServiceConfig {
    init_tracing();
    ServiceConfig::builder()
        .data_dir(tmp.path())
        .retry_base_delay_ms(1)
        .cleanup_interval_secs(3600)
        .build()
        .unwrap()
}

async fn manager(
    config: ServiceConfig,
    pdf: Arc<FakePdf>,
    describer: Arc<FakeDescriber>,
    notifier: Arc<RecordingNotifier>,
) -> TaskManager {
    TaskManager::builder(config)
        .pdf_backend(pdf)
        .describer(describer)
        .notifier(notifier)
        .build()
        .await
        .unwrap()
}

fn pdf_upload(describe_images: bool) -> Upload {
    Upload {
        filename: "report.pdf".into(),
        content_type: "application/pdf".into(),
        bytes: b"%PDF-1.7\n...".to_vec(),
        webhook_url: Some(HOOK.into()),
        describe_images,
    }
}

async fn wait_for(manager: &TaskManager, id: TaskId, pred: impl Fn(&Task) -> bool) -> Task {
    for _ in 0..500 {
        let task = manager.status(id).await.unwrap();
        if pred(&task) {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {id} did not reach the expected state");
}

async fn wait_terminal(manager: &TaskManager, id: TaskId) -> Task {
    wait_for(manager, id, |t| t.state.is_terminal()).await
}

async fn wait_webhook(manager: &TaskManager, id: TaskId) -> Task {
    wait_for(manager, id, |t| t.webhook_attempts > 0).await
}

async fn wait_calls(describer: &FakeDescriber, n: usize) {
    for _ in 0..500 {
        if describer.calls.load(Ordering::SeqCst) >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("describer never reached {n} calls");
}

// ── Tests ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn three_page_pdf_with_two_images_on_page_two() {
    let tmp = TempDir::new().unwrap();
    let describer = Arc::new(FakeDescriber::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let pdf = FakePdf::new(vec![("Introduction", 0), ("Quarterly figures", 2), ("Summary", 0)]);
    let mgr = manager(config(&tmp), pdf, describer.clone(), notifier.clone()).await;

    let id = mgr.submit(pdf_upload(true)).await.unwrap();
    let task = wait_terminal(&mgr, id).await;

    assert_eq!(task.state, TaskState::Succeeded);
    assert!(task.started_at.is_some() && task.completed_at.is_some());
    assert_eq!(
        task.expires_at,
        Some(task.completed_at.unwrap() + chrono::Duration::hours(24))
    );
    assert_eq!(task.image_jobs.len(), 2);
    assert!(task.image_jobs.iter().all(|j| j.status == JobStatus::Done && j.page == 2));
    assert_eq!(describer.calls.load(Ordering::SeqCst), 2);

    let md_name = format!("{id}.md");
    assert_eq!(
        task.outputs,
        vec![md_name.clone(), "images/p2-i1.png".into(), "images/p2-i2.png".into()]
    );

    let md = String::from_utf8(mgr.read_output(id, &md_name).await.unwrap()).unwrap();
    assert_eq!(locators(&md), vec![(1, 3), (2, 3), (3, 3)]);
    assert!(md.starts_with("<!-- Page 1 / 3 -->"));
    let i1 = md.find("![p2-i1](images/p2-i1.png)").unwrap();
    let i2 = md.find("![p2-i2](images/p2-i2.png)").unwrap();
    assert!(md.find("<!-- Page 2 / 3 -->").unwrap() < i1);
    assert!(i1 < i2 && i2 < md.find("<!-- Page 3 / 3 -->").unwrap());
    assert!(md.contains("Image p2-i1: A bar chart"));
    assert!(md.contains("Image p2-i2: A bar chart"));

    let png = mgr.read_output(id, "images/p2-i1.png").await.unwrap();
    assert_eq!(&png[1..4], b"PNG");

    let task = wait_webhook(&mgr, id).await;
    assert_eq!(task.webhook_attempts, 1);
    assert_eq!(task.webhook_last_status, Some(200));
    let sent = notifier.payloads_for(id);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].status, TaskState::Succeeded);
    assert_eq!(sent[0].outputs.as_ref(), Some(&task.outputs));
    assert_eq!(notifier.sent.lock().unwrap()[0].0, HOOK);
}

#[tokio::test]
async fn images_stay_bare_without_describe_flag() {
    let tmp = TempDir::new().unwrap();
    let describer = Arc::new(FakeDescriber::default());
    let pdf = FakePdf::new(vec![("Only page", 1)]);
    let mgr = manager(config(&tmp), pdf, describer.clone(), Default::default()).await;

    let id = mgr.submit(pdf_upload(false)).await.unwrap();
    let task = wait_terminal(&mgr, id).await;

    assert_eq!(task.state, TaskState::Succeeded);
    assert!(task.image_jobs.is_empty());
    assert_eq!(describer.calls.load(Ordering::SeqCst), 0);
    let md = String::from_utf8(mgr.read_output(id, &format!("{id}.md")).await.unwrap()).unwrap();
    assert!(md.contains("![p1-i1](images/p1-i1.png)"));
    assert!(!md.contains("Image p1-i1:"));
}

#[tokio::test]
async fn exhausted_descriptions_still_succeed() {
    let tmp = TempDir::new().unwrap();
    let describer = Arc::new(FakeDescriber {
        fail: true,
        ..Default::default()
    });
    let pdf = FakePdf::new(vec![("Page one", 1), ("Page two", 1)]);
    let mgr = manager(config(&tmp), pdf, describer.clone(), Default::default()).await;

    let id = mgr.submit(pdf_upload(true)).await.unwrap();
    let task = wait_terminal(&mgr, id).await;

    assert_eq!(task.state, TaskState::Succeeded);
    assert!(task.error.is_none());
    for job in &task.image_jobs {
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt_count, 3);
    }
    assert_eq!(describer.calls.load(Ordering::SeqCst), 6);

    let md = String::from_utf8(mgr.read_output(id, &format!("{id}.md")).await.unwrap()).unwrap();
    assert!(md.contains("Image p1-i1: description unavailable"));
    assert!(md.contains("Image p2-i1: description unavailable"));
}

#[tokio::test]
async fn unparsable_pdf_fails_the_task() {
    let tmp = TempDir::new().unwrap();
    let notifier = Arc::new(RecordingNotifier::default());
    let mgr = manager(config(&tmp), FakePdf::new(vec![]), Default::default(), notifier.clone()).await;

    let id = mgr.submit(pdf_upload(true)).await.unwrap();
    let task = wait_terminal(&mgr, id).await;

    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.error_code.as_deref(), Some("CONVERSION_ERROR"));
    assert!(task.error.as_deref().unwrap().contains("unparsable"));
    assert!(task.outputs.is_empty());
    assert!(!task.output_dir.join(format!("{id}.md")).exists());

    wait_webhook(&mgr, id).await;
    let sent = notifier.payloads_for(id);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].status, TaskState::Failed);
    assert_eq!(sent[0].error_code.as_deref(), Some("CONVERSION_ERROR"));
    assert!(sent[0].outputs.is_none());

    // Outputs of a failed task are not downloadable.
    let err = assert_err!(mgr.read_output(id, &format!("{id}.md")).await);
    assert!(matches!(err, ServiceError::NotFound { .. }));
}

#[tokio::test]
async fn storage_loss_mid_run_still_fails_the_task() {
    let tmp = TempDir::new().unwrap();
    let config = config(&tmp);
    let notifier = Arc::new(RecordingNotifier::default());
    let mgr = TaskManager::builder(config.clone())
        .pdf_backend(Arc::new(VanishingStorage {
            tasks_dir: config.tasks_dir(),
        }))
        .without_descriptions()
        .notifier(notifier.clone())
        .build()
        .await
        .unwrap();

    let id = mgr.submit(pdf_upload(false)).await.unwrap();
    let task = wait_webhook(&mgr, id).await;

    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.error_code.as_deref(), Some("STORAGE_ERROR"));
    assert!(task.error.is_some());
    assert!(task.completed_at.is_some());
    assert!(task.outputs.is_empty());

    let sent = notifier.payloads_for(id);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].status, TaskState::Failed);

    // Terminal, so it can be deleted even though its directory is gone.
    assert_ok!(mgr.delete(id).await);
    assert!(matches!(mgr.status(id).await, Err(ServiceError::NotFound { .. })));
}

#[tokio::test]
async fn generic_documents_convert_without_pdf_engine() {
    let tmp = TempDir::new().unwrap();
    let mgr = manager(config(&tmp), FakePdf::new(vec![]), Default::default(), Default::default()).await;

    let id = mgr
        .submit(Upload {
            filename: "people.csv".into(),
            content_type: "text/csv".into(),
            bytes: b"name,age\nAda,36\n".to_vec(),
            ..Upload::default()
        })
        .await
        .unwrap();
    let task = wait_terminal(&mgr, id).await;
    assert_eq!(task.state, TaskState::Succeeded);
    assert_eq!(task.outputs, vec![format!("{id}.md")]);

    let md = String::from_utf8(mgr.read_output(id, &format!("{id}.md")).await.unwrap()).unwrap();
    assert!(md.starts_with("| name | age |"));
    assert!(md.contains("| Ada | 36 |"));
}

#[tokio::test]
async fn invalid_uploads_never_create_tasks() {
    let tmp = TempDir::new().unwrap();
    let config = ServiceConfig::builder()
        .data_dir(tmp.path())
        .max_upload_size(16)
        .build()
        .unwrap();
    let mgr = manager(config, FakePdf::new(vec![]), Default::default(), Default::default()).await;

    let too_big = Upload {
        filename: "a.txt".into(),
        content_type: "text/plain".into(),
        bytes: vec![b'a'; 17],
        ..Upload::default()
    };
    assert!(matches!(
        mgr.submit(too_big).await,
        Err(ServiceError::PayloadTooLarge { size: 17, limit: 16 })
    ));

    let binary = Upload {
        filename: "a.exe".into(),
        content_type: "application/octet-stream".into(),
        bytes: vec![0x4d, 0x5a],
        ..Upload::default()
    };
    assert!(matches!(
        mgr.submit(binary).await,
        Err(ServiceError::UnsupportedType { .. })
    ));

    let bad_hook = Upload {
        filename: "a.txt".into(),
        content_type: "text/plain".into(),
        bytes: b"hi".to_vec(),
        webhook_url: Some("file:///etc/passwd".into()),
        ..Upload::default()
    };
    assert!(matches!(
        mgr.submit(bad_hook).await,
        Err(ServiceError::Validation { .. })
    ));

    assert!(mgr.list().await.is_empty());
}

#[tokio::test]
async fn cancelling_a_queued_task_never_runs_it() {
    let tmp = TempDir::new().unwrap();
    let gate = CancellationToken::new();
    let describer = Arc::new(FakeDescriber {
        gate: Some(gate.clone()),
        ..Default::default()
    });
    let notifier = Arc::new(RecordingNotifier::default());
    let config = ServiceConfig::builder()
        .data_dir(tmp.path())
        .max_concurrent_tasks(1)
        .build()
        .unwrap();
    let pdf = FakePdf::new(vec![("Page", 1)]);
    let mgr = manager(config, pdf, describer.clone(), notifier.clone()).await;

    let first = mgr.submit(pdf_upload(true)).await.unwrap();
    wait_calls(&describer, 1).await;
    let second = mgr.submit(pdf_upload(true)).await.unwrap();
    assert_eq!(mgr.status(second).await.unwrap().state, TaskState::Queued);

    let cancelled = mgr.cancel(second).await.unwrap();
    assert_eq!(cancelled.state, TaskState::Cancelled);
    assert!(cancelled.started_at.is_none());

    gate.cancel();
    assert_eq!(wait_terminal(&mgr, first).await.state, TaskState::Succeeded);

    let second = mgr.status(second).await.unwrap();
    assert_eq!(second.state, TaskState::Cancelled);
    assert!(second.started_at.is_none());
    assert_eq!(describer.calls.load(Ordering::SeqCst), 1);

    wait_webhook(&mgr, second.id).await;
    let sent = notifier.payloads_for(second.id);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].status, TaskState::Cancelled);

    // Cancelling again is a no-op returning the terminal snapshot.
    assert_eq!(mgr.cancel(second.id).await.unwrap().state, TaskState::Cancelled);
    assert_eq!(notifier.payloads_for(second.id).len(), 1);
}

#[tokio::test]
async fn cancelling_a_running_task_stops_at_next_checkpoint() {
    let tmp = TempDir::new().unwrap();
    let gate = CancellationToken::new();
    let describer = Arc::new(FakeDescriber {
        gate: Some(gate.clone()),
        ..Default::default()
    });
    let notifier = Arc::new(RecordingNotifier::default());
    let config = ServiceConfig::builder()
        .data_dir(tmp.path())
        .max_concurrent_descriptions(1)
        .build()
        .unwrap();
    let pdf = FakePdf::new(vec![("Gallery", 3)]);
    let mgr = manager(config, pdf, describer.clone(), notifier.clone()).await;

    let id = mgr.submit(pdf_upload(true)).await.unwrap();
    wait_calls(&describer, 1).await;

    let snapshot = mgr.cancel(id).await.unwrap();
    assert_eq!(snapshot.state, TaskState::Running);

    // The in-flight call is allowed to finish.
    gate.cancel();
    let task = wait_terminal(&mgr, id).await;
    assert_eq!(task.state, TaskState::Cancelled);
    assert_eq!(describer.calls.load(Ordering::SeqCst), 1);
    assert!(task.outputs.is_empty());
    assert!(!task.output_dir.join(format!("{id}.md")).exists());
    assert!(!task.output_dir.join("images").exists());
    let pending = task
        .image_jobs
        .iter()
        .filter(|j| j.status == JobStatus::Pending)
        .count();
    assert_eq!(pending, 2);

    wait_webhook(&mgr, id).await;
    assert_eq!(notifier.payloads_for(id).len(), 1);
}

#[tokio::test]
async fn description_cap_is_shared_across_tasks() {
    let tmp = TempDir::new().unwrap();
    let describer = Arc::new(FakeDescriber {
        delay: Duration::from_millis(20),
        ..Default::default()
    });
    let config = ServiceConfig::builder()
        .data_dir(tmp.path())
        .max_concurrent_tasks(4)
        .max_concurrent_descriptions(2)
        .build()
        .unwrap();
    let pdf = FakePdf::new(vec![("A", 2), ("B", 2)]);
    let mgr = manager(config, pdf, describer.clone(), Default::default()).await;

    let mut ids = Vec::new();
    for _ in 0..4 {
        ids.push(mgr.submit(pdf_upload(true)).await.unwrap());
    }
    for id in ids {
        assert_eq!(wait_terminal(&mgr, id).await.state, TaskState::Succeeded);
    }

    assert_eq!(describer.calls.load(Ordering::SeqCst), 16);
    assert!(describer.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(mgr.description_pool().unwrap().available(), 2);
}

#[tokio::test]
async fn running_tasks_are_bounded() {
    let tmp = TempDir::new().unwrap();
    let config = ServiceConfig::builder()
        .data_dir(tmp.path())
        .max_concurrent_tasks(1)
        .build()
        .unwrap();
    let pdf = FakePdf::holding(vec![("Text only", 0)], Duration::from_millis(30));
    let mgr = manager(config, pdf.clone(), Default::default(), Default::default()).await;

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(mgr.submit(pdf_upload(false)).await.unwrap());
    }
    for id in ids {
        assert_eq!(wait_terminal(&mgr, id).await.state, TaskState::Succeeded);
    }
    assert_eq!(pdf.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn delete_requires_a_finished_task() {
    let tmp = TempDir::new().unwrap();
    let gate = CancellationToken::new();
    let describer = Arc::new(FakeDescriber {
        gate: Some(gate.clone()),
        ..Default::default()
    });
    let mgr = manager(config(&tmp), FakePdf::new(vec![("P", 1)]), describer.clone(), Default::default()).await;

    let id = mgr.submit(pdf_upload(true)).await.unwrap();
    wait_calls(&describer, 1).await;
    assert!(matches!(
        mgr.delete(id).await,
        Err(ServiceError::Conflict { .. })
    ));

    gate.cancel();
    let task = wait_terminal(&mgr, id).await;
    assert_ok!(mgr.delete(id).await);

    assert!(matches!(mgr.status(id).await, Err(ServiceError::NotFound { .. })));
    assert!(!task.output_dir.exists());
    assert!(matches!(mgr.delete(id).await, Err(ServiceError::NotFound { .. })));
    assert!(matches!(mgr.delete(Uuid::now_v7()).await, Err(ServiceError::NotFound { .. })));
}

#[tokio::test]
async fn output_reads_stay_inside_the_task() {
    let tmp = TempDir::new().unwrap();
    let mgr = manager(config(&tmp), FakePdf::new(vec![("P", 1)]), Default::default(), Default::default()).await;

    let id = mgr.submit(pdf_upload(false)).await.unwrap();
    wait_terminal(&mgr, id).await;

    for path in ["../task.json", "task.json", "input/report.pdf", "/etc/passwd", "images/../task.json", "images"] {
        let err = assert_err!(mgr.read_output(id, path).await, "{path}");
        assert!(matches!(err, ServiceError::NotFound { .. }), "{path}");
    }

    let zip = mgr.archive(id).await.unwrap();
    let archive = zip::ZipArchive::new(std::io::Cursor::new(zip)).unwrap();
    let mut names: Vec<_> = archive.file_names().map(str::to_string).collect();
    names.sort();
    assert_eq!(names, vec![format!("{id}.md"), "images/p1-i1.png".to_string()]);
}

#[tokio::test]
async fn expired_tasks_are_swept() {
    let tmp = TempDir::new().unwrap();
    let config = ServiceConfig::builder()
        .data_dir(tmp.path())
        .retention_hours(0)
        .cleanup_interval_secs(3600)
        .build()
        .unwrap();
    let mgr = manager(config, FakePdf::new(vec![("P", 0)]), Default::default(), Default::default()).await;

    let id = mgr.submit(pdf_upload(false)).await.unwrap();
    let task = wait_webhook(&mgr, id).await;
    assert_eq!(task.state, TaskState::Succeeded);

    assert_eq!(mgr.sweep_expired().await, 1);
    assert!(matches!(mgr.status(id).await, Err(ServiceError::NotFound { .. })));
    assert!(matches!(
        mgr.read_output(id, &format!("{id}.md")).await,
        Err(ServiceError::NotFound { .. })
    ));
    assert!(matches!(mgr.archive(id).await, Err(ServiceError::NotFound { .. })));
    assert!(!task.output_dir.exists());
}

#[tokio::test]
async fn restart_fails_interrupted_and_resumes_queued() {
    let tmp = TempDir::new().unwrap();
    let config = config(&tmp);

    // Leave behind what a crashed process would: one running, one queued.
    let store = TaskStore::new(config.tasks_dir());
    let running_id = Uuid::now_v7();
    let mut running = Task::new(running_id, "a.pdf", "application/pdf", 8, store.task_dir(running_id));
    running.webhook_url = Some(HOOK.into());
    let entry = store.insert(running).await.unwrap();
    entry
        .update(|t| t.transition(TaskState::Running, Utc::now()))
        .await
        .unwrap();
    std::fs::write(store.task_dir(running_id).join(format!("{running_id}.md")), "partial").unwrap();

    let queued_id = Uuid::now_v7();
    let queued = Task::new(queued_id, "notes.txt", "text/plain", 5, store.task_dir(queued_id));
    store.insert(queued).await.unwrap();
    std::fs::create_dir_all(store.task_dir(queued_id).join("input")).unwrap();
    std::fs::write(store.task_dir(queued_id).join("input/notes.txt"), "hello").unwrap();
    drop(store);

    let notifier = Arc::new(RecordingNotifier::default());
    let mgr = manager(config, FakePdf::new(vec![]), Default::default(), notifier.clone()).await;

    let interrupted = wait_webhook(&mgr, running_id).await;
    assert_eq!(interrupted.state, TaskState::Failed);
    assert_eq!(interrupted.error_code.as_deref(), Some("INTERRUPTED"));
    assert!(!interrupted.output_dir.join(format!("{running_id}.md")).exists());
    assert_eq!(notifier.payloads_for(running_id)[0].status, TaskState::Failed);

    let resumed = wait_terminal(&mgr, queued_id).await;
    assert_eq!(resumed.state, TaskState::Succeeded);
    let md = mgr.read_output(queued_id, &format!("{queued_id}.md")).await.unwrap();
    assert_eq!(md, b"hello\n");

    let ids: Vec<_> = mgr.list().await.into_iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![running_id, queued_id]);
}

#[tokio::test]
async fn shutdown_stops_new_submissions() {
    let tmp = TempDir::new().unwrap();
    let mgr = manager(config(&tmp), FakePdf::new(vec![]), Default::default(), Default::default()).await;
    mgr.shutdown().await;

    let err = assert_err!(mgr.submit(pdf_upload(false)).await);
    assert_eq!(err.code(), "INTERNAL_ERROR");
}
