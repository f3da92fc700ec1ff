use serde_json::json;
use stategraph::runtimes::{Checkpoint, Checkpointer, InMemoryCheckpointer};
use stategraph::state::ChannelStore;
use stategraph::types::NodeId;

mod common;

fn sample_checkpoint(thread: &str, step: u64) -> Checkpoint {
    let store = ChannelStore::builder()
        .with("messages", json!([format!("at step {step}")]))
        .with("count", json!(step))
        .build();
    Checkpoint::new(thread, step, store, vec![NodeId::named("next"), NodeId::End], 4)
        .with_execution(
            vec![NodeId::named("worker")],
            vec![NodeId::Start],
            vec!["messages".to_string()],
        )
}

/// Contract shared by every backend: latest tracking, exact-step lookup,
/// single-timeline truncation, and thread isolation.
async fn exercise_backend(cp: &dyn Checkpointer) {
    for step in 0..4 {
        cp.put(sample_checkpoint("alpha", step)).await.unwrap();
    }
    cp.put(sample_checkpoint("beta", 9)).await.unwrap();

    let latest = cp.get_latest("alpha").await.unwrap().unwrap();
    assert_eq!(latest.step, 3);
    assert_eq!(latest.store.get("count"), Some(&json!(3)));
    assert_eq!(latest.frontier, vec![NodeId::named("next"), NodeId::End]);
    assert_eq!(latest.ran_nodes, vec![NodeId::named("worker")]);
    assert_eq!(latest.skipped_nodes, vec![NodeId::Start]);
    assert_eq!(latest.updated_channels, vec!["messages".to_string()]);
    assert_eq!(latest.concurrency_limit, 4);

    let middle = cp.get("alpha", 1).await.unwrap().unwrap();
    assert_eq!(middle.store.get("count"), Some(&json!(1)));
    assert_eq!(middle.store.version("count"), 1);
    assert!(cp.get("alpha", 42).await.unwrap().is_none());
    assert!(cp.get_latest("missing").await.unwrap().is_none());

    assert_eq!(cp.list_threads().await.unwrap(), vec!["alpha", "beta"]);
    assert_eq!(cp.list_steps("alpha").await.unwrap(), vec![0, 1, 2, 3]);
    assert_eq!(cp.list_steps("beta").await.unwrap(), vec![9]);

    // Rewriting step 1 discards the stale future of that thread only.
    cp.put(sample_checkpoint("alpha", 1)).await.unwrap();
    assert_eq!(cp.list_steps("alpha").await.unwrap(), vec![0, 1]);
    assert_eq!(cp.get_latest("alpha").await.unwrap().unwrap().step, 1);
    assert_eq!(cp.get_latest("beta").await.unwrap().unwrap().step, 9);
}

#[tokio::test]
async fn in_memory_backend_honors_the_contract() {
    let cp = InMemoryCheckpointer::new();
    exercise_backend(&cp).await;
}

#[cfg(feature = "sqlite")]
mod sqlite {
    use std::sync::Arc;

    use serde_json::json;
    use stategraph::runtimes::{Checkpointer, Runner, SQLiteCheckpointer};
    use stategraph::state::ChannelStore;

    use super::{common::*, exercise_backend, sample_checkpoint};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sqlite_backend_honors_the_contract() {
        let cp = SQLiteCheckpointer::connect("sqlite::memory:")
            .await
            .expect("connect sqlite memory");
        exercise_backend(&cp).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resaving_a_step_is_idempotent() {
        let cp = SQLiteCheckpointer::connect("sqlite::memory:")
            .await
            .expect("connect");
        cp.put(sample_checkpoint("t", 2)).await.unwrap();
        cp.put(sample_checkpoint("t", 2)).await.unwrap();
        assert_eq!(cp.list_steps("t").await.unwrap(), vec![2]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn checkpoints_survive_a_reconnect() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("checkpoints.db");
        std::fs::File::create(&db_path).expect("touch db file");
        let url = format!("sqlite://{}", db_path.display());

        {
            let cp = SQLiteCheckpointer::connect(&url).await.expect("connect");
            cp.put(sample_checkpoint("durable", 5)).await.unwrap();
        }

        let cp = SQLiteCheckpointer::connect(&url).await.expect("reconnect");
        let restored = cp.get_latest("durable").await.unwrap().unwrap();
        assert_eq!(restored.step, 5);
        assert_eq!(restored.store.get("count"), Some(&json!(5)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn runner_resumes_across_processes_from_sqlite() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("runs.db");
        std::fs::File::create(&db_path).expect("touch db file");
        let url = format!("sqlite://{}", db_path.display());

        let plan = Arc::new(linear_plan());

        // First "process": run only the first superstep, then go away.
        {
            let cp: Arc<dyn Checkpointer> =
                Arc::new(SQLiteCheckpointer::connect(&url).await.expect("connect"));
            let mut runner = Runner::with_checkpointer(
                Arc::clone(&plan),
                Some(cp),
                true,
                stategraph::event_bus::EventBus::default(),
                true,
            );
            runner
                .create_thread("job".into(), store_with_messages())
                .await
                .unwrap();
            runner
                .run_step("job", stategraph::runtimes::StepOptions::default())
                .await
                .unwrap();
        }

        // Second "process": same thread id picks up at step 1 and finishes.
        let cp: Arc<dyn Checkpointer> =
            Arc::new(SQLiteCheckpointer::connect(&url).await.expect("reconnect"));
        let mut runner = Runner::with_checkpointer(
            plan,
            Some(cp),
            true,
            stategraph::event_bus::EventBus::default(),
            true,
        );
        let init = runner
            .create_thread("job".into(), ChannelStore::default())
            .await
            .unwrap();
        assert_eq!(
            init,
            stategraph::runtimes::ThreadInit::Resumed { checkpoint_step: 1 }
        );

        let final_snapshot = runner.run_until_complete("job").await.unwrap();
        assert_messages(&final_snapshot, &["ran:a:step:1", "ran:b:step:2"]);
    }
}
