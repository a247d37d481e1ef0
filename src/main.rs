use std::{thread, time::Duration};

use rand::Rng;
use tl_async_engine::{
    sleep_for, spawn, telemetry, wait_any_for, Awaitable, Engine, EngineConfig, TaskWithResult,
};
use tracing::info;

fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();

    let engine = Engine::new(EngineConfig::default().with_ev_threads(2))?;
    let finished = engine.block_on(async {
        let mut tasks: Vec<TaskWithResult<usize>> = (0..10)
            .map(|i| {
                spawn(async move {
                    let ms = rand::thread_rng().gen_range(0..500);
                    sleep_for(Duration::from_millis(ms)).await;
                    print_from_thread(i).await;
                    i
                })
            })
            .collect();

        let mut order = vec![];
        loop {
            let operands: Vec<&dyn Awaitable> = tasks.iter().map(|t| t as &dyn Awaitable).collect();
            let Some(index) = wait_any_for(Duration::from_secs(1), &operands).await else {
                break;
            };
            if let Ok(i) = tasks[index].get().await {
                order.push(i);
            }
        }
        order
    })?;

    info!(?finished, "all tasks done");
    Ok(())
}

async fn print_from_thread(i: usize) {
    sleep_for(Duration::from_millis(10)).await;
    info!("Hi from inside task {}! {:?}", i, thread::current().id());
}
