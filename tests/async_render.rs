use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use blockjinja::{Environment, MemoryLoader, Loader, Result, Source, Value};
use serde_json::json;

fn slow_env() -> Environment {
    let mut env = Environment::new();
    env.add_async_filter("slow_upper", |value, args| async move {
        let millis = args.first().and_then(Value::as_i64).unwrap_or(5);
        tokio::time::sleep(Duration::from_millis(millis as u64)).await;
        Ok(Value::from(value.to_string().to_uppercase()))
    });
    env
}

#[tokio::test]
async fn async_filters_in_output() {
    let env = slow_env();
    let out = env
        .render_string_async("{{ 'a' | slow_upper }}-{{ name | slow_upper | slow_upper }}", json!({ "name": "bob" }))
        .await
        .unwrap();
    assert_eq!(out, "A-BOB");
}

#[tokio::test]
async fn async_filters_in_conditions_and_loops() {
    let env = slow_env();
    let source = "{% for x in xs %}{% if x | slow_upper == 'B' %}[{{ x | slow_upper }}]{% else %}{{ x }}{% endif %}{% endfor %}";
    let out = env.render_string_async(source, json!({ "xs": ["a", "b", "c"] })).await.unwrap();
    assert_eq!(out, "a[B]c");
}

#[tokio::test]
async fn async_filter_in_set() {
    let env = slow_env();
    let out = env
        .render_string_async("{% set loud = word | slow_upper %}{{ loud }}{{ loud }}", json!({ "word": "hey" }))
        .await
        .unwrap();
    assert_eq!(out, "HEYHEY");
}

#[tokio::test]
async fn async_each_keeps_order() {
    let env = slow_env();
    let source = "{% asyncEach d in delays %}{{ d | slow_upper(d) }}{% endeach %}";
    let out = env.render_string_async(source, json!({ "delays": [20, 1, 10] })).await.unwrap();
    assert_eq!(out, "20110");
}

#[tokio::test]
async fn async_all_joins_in_index_order() {
    let env = slow_env();
    let source = "{% asyncAll d in delays %}<{{ loop.index }}:{{ d | slow_upper(d) }}>{% endall %}";
    let out = env.render_string_async(source, json!({ "delays": [30, 1, 15] })).await.unwrap();
    assert_eq!(out, "<1:30><2:1><3:15>");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_all_runs_iterations_concurrently() {
    let env = slow_env();
    let source = "{% asyncAll d in delays %}{{ d | slow_upper(d) }}{% endall %}";
    let delays: Vec<i64> = vec![100; 5];
    let started = std::time::Instant::now();
    env.render_string_async(source, json!({ "delays": delays })).await.unwrap();
    // Sequential iterations would need at least 500ms
    assert!(started.elapsed() < Duration::from_millis(450));
}

#[test]
fn sync_render_refuses_to_block() {
    let mut env = Environment::new();
    env.add_async_filter("stalled", |value, _| async move {
        futures::future::pending::<()>().await;
        Ok(value)
    });
    let err = env.render_string("{{ 'a' | stalled }}", json!({})).unwrap_err();
    assert!(err.message().contains("render_async"), "{}", err);
    // Templates without suspending calls still render synchronously
    assert_eq!(env.render_string("{{ 'a' }}", json!({})).unwrap(), "a");
}

/// A loader that waits before answering and counts its calls.
struct SlowLoader {
    calls: Arc<AtomicUsize>,
}

#[async_trait(?Send)]
impl Loader for SlowLoader {
    async fn get_source(&self, name: &str) -> Result<Option<Source>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2)).await;
        Ok(match name {
            "page.html" => Some(Source {
                text: "{% include 'part.html' %}!".to_string(),
                path: name.to_string(),
                cacheable: true,
            }),
            "part.html" => Some(Source {
                text: "part".to_string(),
                path: name.to_string(),
                cacheable: true,
            }),
            _ => None,
        })
    }
}

#[tokio::test]
async fn async_loaders_and_caching() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut env = Environment::new();
    env.add_loader(SlowLoader { calls: Arc::clone(&calls) });

    assert_eq!(env.render_async("page.html", json!({})).await.unwrap(), "part!");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(env.render_async("page.html", json!({})).await.unwrap(), "part!");
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    env.invalidate_cache();
    assert_eq!(env.render_async("page.html", json!({})).await.unwrap(), "part!");
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn callback_is_called_once_with_the_outcome() {
    let mut env = Environment::new();
    env.add_loader(MemoryLoader::new().with_template("ok.html", "{{ 1 + 1 }}"));

    let mut results = Vec::new();
    env.render_with_callback("ok.html", json!({}), |r| results.push(r)).await;
    env.render_with_callback("missing.html", json!({}), |r| results.push(r)).await;
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].as_deref().unwrap(), "2");
    assert!(results[1].is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn renders_on_many_tasks() {
    let mut env = slow_env();
    env.add_loader(MemoryLoader::new().with_template("greet.html", "hello {{ name | slow_upper(1) }}"));
    let env = Arc::new(env);

    // Render futures are not `Send`, so each task drives its own
    let handles: Vec<_> = (0..6)
        .map(|i| {
            let env = Arc::clone(&env);
            tokio::task::spawn_blocking(move || {
                let runtime = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
                runtime.block_on(env.render_async("greet.html", json!({ "name": format!("n{}", i) })))
            })
        })
        .collect();
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap().unwrap(), format!("hello N{}", i));
    }
}
