//! Upload Session Controller Tests
//!
//! Drives the controller against a scripted transport and checks state
//! transitions, offsets and fencing of late results.

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tus_uploadr::session::{ControllerOptions, SessionState, Snapshot, UploadController};
    use tus_uploadr::store::{MemoryStore, ResourceStore, StoredResource};
    use tus_uploadr::tus::{ClientError, ProgressCallback, RangeHandle, Transport, UploadResource};
    use tus_uploadr::upload::{MemoryFile, UploadableFile};

    enum CreateStep {
        Ok(UploadResource),
        Hold(Arc<Notify>, UploadResource),
    }

    enum RangeStep {
        Ack(u64),
        Fail(ClientError),
        Hold(Arc<Notify>, u64),
    }

    #[derive(Default)]
    struct FakeState {
        creates: Mutex<VecDeque<CreateStep>>,
        heads: Mutex<VecDeque<Result<u64, ClientError>>>,
        ranges: Mutex<VecDeque<RangeStep>>,
        create_count: AtomicUsize,
        priors: Mutex<Vec<Option<String>>>,
        sent_from: Mutex<Vec<u64>>,
        terminated: Mutex<Vec<String>>,
    }

    /// Transport answering from scripted steps
    #[derive(Clone, Default)]
    struct FakeTransport {
        state: Arc<FakeState>,
    }

    impl FakeTransport {
        fn create(&self, step: CreateStep) -> &Self {
            self.state.creates.lock().unwrap().push_back(step);
            self
        }

        fn head(&self, result: Result<u64, ClientError>) -> &Self {
            self.state.heads.lock().unwrap().push_back(result);
            self
        }

        fn range(&self, step: RangeStep) -> &Self {
            self.state.ranges.lock().unwrap().push_back(step);
            self
        }

        fn sent_from(&self) -> Vec<u64> {
            self.state.sent_from.lock().unwrap().clone()
        }

        fn creates(&self) -> usize {
            self.state.create_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn endpoint(&self) -> String {
            "http://fake/files/".to_string()
        }

        async fn create_or_locate(
            &self,
            _file: Arc<dyn UploadableFile>,
            prior: Option<StoredResource>,
        ) -> Result<UploadResource, ClientError> {
            let n = self.state.create_count.fetch_add(1, Ordering::SeqCst) + 1;
            self.state
                .priors
                .lock()
                .unwrap()
                .push(prior.map(|p| p.url));

            let step = self.state.creates.lock().unwrap().pop_front();
            match step {
                Some(CreateStep::Ok(resource)) => Ok(resource),
                Some(CreateStep::Hold(release, resource)) => {
                    release.notified().await;
                    Ok(resource)
                }
                None => Ok(resource(&format!("http://fake/files/{}", n), 0)),
            }
        }

        async fn query_received_bytes(&self, _resource: &UploadResource) -> Result<u64, ClientError> {
            let result = self.state.heads.lock().unwrap().pop_front();
            result.unwrap_or_else(|| Err(ClientError::ProtocolError("unscripted HEAD".into())))
        }

        fn send_range(
            &self,
            _resource: &UploadResource,
            file: Arc<dyn UploadableFile>,
            from_offset: u64,
            progress: ProgressCallback,
        ) -> RangeHandle {
            self.state.sent_from.lock().unwrap().push(from_offset);
            let total = file.size();
            drop(file);

            let step = self.state.ranges.lock().unwrap().pop_front();
            RangeHandle::spawn(from_offset, async move {
                match step {
                    Some(RangeStep::Ack(offset)) => {
                        progress(offset, total);
                        Ok(offset)
                    }
                    Some(RangeStep::Fail(e)) => Err(e),
                    Some(RangeStep::Hold(release, offset)) => {
                        release.notified().await;
                        Ok(offset)
                    }
                    None => Err(ClientError::ProtocolError("unscripted PATCH".into())),
                }
            })
        }

        async fn terminate(&self, resource: &UploadResource) -> Result<(), ClientError> {
            self.state
                .terminated
                .lock()
                .unwrap()
                .push(resource.url.clone());
            Ok(())
        }
    }

    fn resource(url: &str, received_bytes: u64) -> UploadResource {
        UploadResource {
            url: url.to_string(),
            received_bytes,
        }
    }

    fn file(size: usize) -> Arc<MemoryFile> {
        Arc::new(MemoryFile::new("movie.mp4", "video/mp4", vec![1u8; size]))
    }

    fn controller(fake: &FakeTransport) -> (UploadController<FakeTransport>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let controller = UploadController::new(fake.clone(), store.clone() as Arc<dyn ResourceStore>);
        (controller, store)
    }

    async fn wait_for(
        controller: &UploadController<FakeTransport>,
        mut predicate: impl FnMut(&Snapshot) -> bool,
    ) -> Snapshot {
        let mut updates = controller.subscribe();
        let waiting = updates.wait_for(|s| predicate(s));
        let snapshot = tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .expect("timed out waiting for snapshot")
            .expect("controller dropped")
            .clone();
        snapshot
    }

    async fn wait_for_state(controller: &UploadController<FakeTransport>, state: SessionState) -> Snapshot {
        wait_for(controller, |s| s.state == state).await
    }

    async fn eventually(condition: impl Fn() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_three_ranges_complete_the_upload() {
        let fake = FakeTransport::default();
        fake.range(RangeStep::Ack(3_333_333))
            .range(RangeStep::Ack(6_666_666))
            .range(RangeStep::Ack(10_000_000));
        let (controller, store) = controller(&fake);

        controller.start(file(10_000_000));
        assert_eq!(controller.state(), SessionState::Uploading);

        let done = wait_for_state(&controller, SessionState::Succeeded).await;

        assert_eq!(done.progress_percent, 100.0);
        assert_eq!(done.received_bytes, 10_000_000);
        assert_eq!(fake.sent_from(), vec![0, 3_333_333, 6_666_666]);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_resume_continues_from_server_offset() {
        let fake = FakeTransport::default();
        let held = Arc::new(Notify::new());
        fake.range(RangeStep::Ack(4_000_000))
            .range(RangeStep::Hold(held.clone(), 8_000_000))
            .head(Ok(4_000_000))
            .range(RangeStep::Ack(10_000_000));
        let (controller, _store) = controller(&fake);

        controller.start(file(10_000_000));
        eventually(|| fake.sent_from().len() == 2).await;
        assert_eq!(controller.snapshot().received_bytes, 4_000_000);

        controller.pause();
        let paused = controller.snapshot();
        assert_eq!(paused.state, SessionState::Paused);
        assert_eq!(paused.progress_percent, 40.0);

        controller.resume();
        wait_for_state(&controller, SessionState::Succeeded).await;

        assert_eq!(fake.sent_from(), vec![0, 4_000_000, 4_000_000]);
        assert_eq!(fake.creates(), 1);
    }

    #[tokio::test]
    async fn test_transport_error_pauses_and_resume_retries_from_zero() {
        let fake = FakeTransport::default();
        fake.range(RangeStep::Fail(ClientError::TransportError(
            "connection reset".into(),
        )))
        .head(Ok(0))
        .range(RangeStep::Ack(1_000));
        let (controller, _store) = controller(&fake);

        controller.start(file(1_000));
        let paused = wait_for_state(&controller, SessionState::Paused).await;
        assert!(paused.message.unwrap().contains("connection reset"));
        assert_eq!(paused.received_bytes, 0);

        controller.resume();
        assert_eq!(controller.state(), SessionState::Uploading);
        wait_for_state(&controller, SessionState::Succeeded).await;

        assert_eq!(fake.sent_from(), vec![0, 0]);
    }

    #[tokio::test]
    async fn test_cancel_after_pause_releases_file() {
        let fake = FakeTransport::default();
        fake.range(RangeStep::Hold(Arc::new(Notify::new()), 500));
        let (controller, store) = controller(&fake);

        let file = file(1_000);
        let weak = Arc::downgrade(&file);
        controller.start(file);
        eventually(|| fake.sent_from().len() == 1).await;

        controller.pause();
        controller.cancel();

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.state, SessionState::Cancelled);
        assert_eq!(snapshot.progress_percent, 0.0);
        assert_eq!(snapshot.active_file_name, None);
        assert!(store.is_empty());

        eventually(|| weak.upgrade().is_none()).await;
    }

    #[tokio::test]
    async fn test_resume_recreates_missing_resource() {
        let fake = FakeTransport::default();
        fake.create(CreateStep::Ok(resource("http://fake/files/old", 0)))
            .range(RangeStep::Fail(ClientError::TransportError("timeout".into())))
            .head(Err(ClientError::ResourceNotFound("HEAD returned 404".into())))
            .create(CreateStep::Ok(resource("http://fake/files/new", 0)))
            .range(RangeStep::Ack(2_048));
        let (controller, _store) = controller(&fake);

        controller.start(file(2_048));
        wait_for_state(&controller, SessionState::Paused).await;

        controller.resume();
        assert_eq!(controller.state(), SessionState::Uploading);

        wait_for_state(&controller, SessionState::Succeeded).await;
        assert_eq!(fake.creates(), 2);
        assert_eq!(fake.sent_from(), vec![0, 0]);
        // The expired hint is not offered again
        assert_eq!(*fake.state.priors.lock().unwrap(), vec![None, None]);
    }

    #[tokio::test]
    async fn test_server_offset_beyond_file_pauses() {
        let fake = FakeTransport::default();
        fake.range(RangeStep::Fail(ClientError::TransportError("timeout".into())))
            .head(Ok(4_096));
        let (controller, _store) = controller(&fake);

        controller.start(file(1_024));
        wait_for_state(&controller, SessionState::Paused).await;

        controller.resume();
        let paused = wait_for_state(&controller, SessionState::Paused).await;

        assert!(paused.message.unwrap().contains("4096 bytes of a 1024 byte file"));
        assert_eq!(fake.sent_from(), vec![0]);
    }

    #[tokio::test]
    async fn test_pause_is_idempotent() {
        let fake = FakeTransport::default();
        fake.range(RangeStep::Hold(Arc::new(Notify::new()), 10));
        let (controller, _store) = controller(&fake);

        controller.start(file(10));
        controller.pause();
        let first = controller.snapshot();
        controller.pause();

        assert_eq!(controller.snapshot(), first);
        assert_eq!(first.state, SessionState::Paused);
    }

    #[tokio::test]
    async fn test_resource_created_while_paused_is_reused() {
        let fake = FakeTransport::default();
        let release = Arc::new(Notify::new());
        fake.create(CreateStep::Hold(
            release.clone(),
            resource("http://fake/files/slow", 0),
        ))
        .head(Ok(0))
        .range(RangeStep::Ack(100));
        let (controller, store) = controller(&fake);

        controller.start(file(100));
        eventually(|| fake.creates() == 1).await;
        controller.pause();

        release.notify_one();
        eventually(|| store.len() == 1).await;

        // The late creation did not restart sending
        assert_eq!(controller.state(), SessionState::Paused);
        assert!(fake.sent_from().is_empty());

        controller.resume();
        wait_for_state(&controller, SessionState::Succeeded).await;
        assert_eq!(fake.creates(), 1);
        assert_eq!(fake.sent_from(), vec![0]);
    }

    #[tokio::test]
    async fn test_resume_waits_for_outstanding_creation() {
        let fake = FakeTransport::default();
        let release = Arc::new(Notify::new());
        fake.create(CreateStep::Hold(
            release.clone(),
            resource("http://fake/files/first", 0),
        ))
        .head(Ok(0))
        .range(RangeStep::Ack(50))
        .range(RangeStep::Hold(Arc::new(Notify::new()), 100))
        .head(Ok(50))
        .range(RangeStep::Ack(100));
        let (controller, store) = controller(&fake);

        controller.start(file(100));
        eventually(|| fake.creates() == 1).await;
        controller.pause();
        controller.resume();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fake.creates(), 1);
        assert!(fake.sent_from().is_empty());

        release.notify_one();
        wait_for(&controller, |s| s.received_bytes == 50).await;
        eventually(|| fake.sent_from().len() == 2).await;

        // The second resume continues on the same resource
        controller.pause();
        controller.resume();
        wait_for_state(&controller, SessionState::Succeeded).await;

        assert_eq!(fake.creates(), 1);
        assert_eq!(fake.sent_from(), vec![0, 50, 50]);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_absorbs_late_creation() {
        let fake = FakeTransport::default();
        let release = Arc::new(Notify::new());
        fake.create(CreateStep::Hold(
            release.clone(),
            resource("http://fake/files/slow", 0),
        ));
        let (controller, store) = controller(&fake);

        controller.start(file(100));
        eventually(|| fake.creates() == 1).await;
        controller.cancel();

        release.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(controller.state(), SessionState::Cancelled);
        assert!(store.is_empty());
        assert!(fake.sent_from().is_empty());
    }

    #[tokio::test]
    async fn test_server_rejection_requires_cancel() {
        let fake = FakeTransport::default();
        fake.range(RangeStep::Fail(ClientError::ServerRejected {
            status: 413,
            message: "PATCH rejected".into(),
        }));
        let (controller, _store) = controller(&fake);

        controller.start(file(64));
        let paused = wait_for_state(&controller, SessionState::Paused).await;
        assert!(paused.message.unwrap().contains("413"));

        controller.resume();
        assert_eq!(controller.state(), SessionState::Paused);
        assert_eq!(fake.sent_from(), vec![0]);

        controller.cancel();
        assert_eq!(controller.state(), SessionState::Cancelled);

        // A fresh start is allowed after cancelling
        fake.range(RangeStep::Ack(64));
        controller.start(file(64));
        wait_for_state(&controller, SessionState::Succeeded).await;
    }

    #[tokio::test]
    async fn test_invalid_operations_are_ignored() {
        let fake = FakeTransport::default();
        fake.range(RangeStep::Hold(Arc::new(Notify::new()), 10));
        let (controller, _store) = controller(&fake);

        controller.resume();
        controller.cancel();
        controller.pause();
        assert_eq!(controller.state(), SessionState::Idle);

        controller.start(file(10));
        eventually(|| fake.sent_from().len() == 1).await;

        // Already uploading
        controller.start(file(99));
        controller.resume();
        assert_eq!(controller.state(), SessionState::Uploading);
        assert_eq!(controller.snapshot().total_bytes, 10);
        assert_eq!(fake.creates(), 1);
    }

    #[tokio::test]
    async fn test_empty_file_succeeds_without_ranges() {
        let fake = FakeTransport::default();
        let (controller, _store) = controller(&fake);

        controller.start(file(0));
        let done = wait_for_state(&controller, SessionState::Succeeded).await;

        assert_eq!(done.progress_percent, 100.0);
        assert!(fake.sent_from().is_empty());
    }

    #[tokio::test]
    async fn test_progress_is_reported_while_uploading() {
        let fake = FakeTransport::default();
        fake.range(RangeStep::Ack(50))
            .range(RangeStep::Hold(Arc::new(Notify::new()), 100));
        let (controller, _store) = controller(&fake);

        controller.start(file(100));
        let halfway = wait_for(&controller, |s| s.received_bytes == 50).await;

        assert_eq!(halfway.state, SessionState::Uploading);
        assert_eq!(halfway.progress_percent, 50.0);
        assert_eq!(halfway.active_file_name.as_deref(), Some("movie.mp4"));
    }

    #[tokio::test]
    async fn test_start_reuses_remembered_resource() {
        let store = Arc::new(MemoryStore::new());

        let first = FakeTransport::default();
        first
            .create(CreateStep::Ok(resource("http://fake/files/kept", 0)))
            .range(RangeStep::Fail(ClientError::TransportError("offline".into())));
        let controller = UploadController::new(first.clone(), store.clone() as Arc<dyn ResourceStore>);
        controller.start(file(10));
        wait_for_state(&controller, SessionState::Paused).await;
        assert_eq!(store.len(), 1);

        // A new controller for the same file offers the remembered resource
        let second = FakeTransport::default();
        second
            .create(CreateStep::Ok(resource("http://fake/files/kept", 6)))
            .range(RangeStep::Ack(10));
        let controller = UploadController::new(second.clone(), store.clone() as Arc<dyn ResourceStore>);
        controller.start(file(10));
        wait_for_state(&controller, SessionState::Succeeded).await;

        assert_eq!(
            *second.state.priors.lock().unwrap(),
            vec![Some("http://fake/files/kept".to_string())]
        );
        assert_eq!(second.sent_from(), vec![6]);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_terminates_resource_when_configured() {
        let fake = FakeTransport::default();
        fake.create(CreateStep::Ok(resource("http://fake/files/doomed", 0)))
            .range(RangeStep::Hold(Arc::new(Notify::new()), 10));
        let controller = UploadController::with_options(
            fake.clone(),
            Arc::new(MemoryStore::new()),
            ControllerOptions {
                terminate_on_cancel: true,
            },
        );

        controller.start(file(10));
        eventually(|| fake.sent_from().len() == 1).await;
        controller.cancel();

        eventually(|| fake.state.terminated.lock().unwrap().len() == 1).await;
        assert_eq!(
            fake.state.terminated.lock().unwrap()[0],
            "http://fake/files/doomed"
        );
    }

    #[tokio::test]
    async fn test_cancel_terminates_late_creation_when_configured() {
        let fake = FakeTransport::default();
        let release = Arc::new(Notify::new());
        fake.create(CreateStep::Hold(
            release.clone(),
            resource("http://fake/files/late", 0),
        ));
        let store = Arc::new(MemoryStore::new());
        let controller = UploadController::with_options(
            fake.clone(),
            store.clone() as Arc<dyn ResourceStore>,
            ControllerOptions {
                terminate_on_cancel: true,
            },
        );

        controller.start(file(10));
        eventually(|| fake.creates() == 1).await;
        controller.cancel();
        assert!(fake.state.terminated.lock().unwrap().is_empty());

        release.notify_one();
        eventually(|| fake.state.terminated.lock().unwrap().len() == 1).await;

        assert_eq!(
            fake.state.terminated.lock().unwrap()[0],
            "http://fake/files/late"
        );
        assert_eq!(controller.state(), SessionState::Cancelled);
        assert!(store.is_empty());
        assert!(fake.sent_from().is_empty());
    }

    #[tokio::test]
    async fn test_reset_returns_to_idle() {
        let fake = FakeTransport::default();
        fake.range(RangeStep::Ack(10));
        let (controller, _store) = controller(&fake);

        controller.start(file(10));
        wait_for_state(&controller, SessionState::Succeeded).await;

        controller.reset();
        assert_eq!(controller.snapshot(), Snapshot::idle());
    }
}
