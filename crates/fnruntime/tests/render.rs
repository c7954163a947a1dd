use std::sync::Arc;
use std::time::Duration;

use kpt_core::{CancellationToken, ErrorKind};
use kpt_fnruntime::{eval, render, BuiltinRunner, FnResult, FnRuntime, ScriptedRunner, Severity};
use kpt_pkg::{read_resources, FileSet, Function, ReadOptions};

const ROOT_KPTFILE: &str = "apiVersion: kpt.dev/v1
kind: Kptfile
metadata:
  name: root
pipeline:
  mutators:
    - image: example.com/fns/stamp:v1
  validators:
    - image: example.com/fns/check:v1
";

const SUB_KPTFILE: &str = "apiVersion: kpt.dev/v1
kind: Kptfile
metadata:
  name: sub
pipeline:
  mutators:
    - image: example.com/fns/stamp:v1
";

fn package() -> FileSet {
    let mut f = FileSet::new();
    f.insert("Kptfile", ROOT_KPTFILE);
    f.insert("cm.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: root-cm # keep me\ndata:\n  a: \"1\"\n");
    f.insert("sub/Kptfile", SUB_KPTFILE);
    f.insert("sub/cm.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: sub-cm\n");
    f
}

/// Appends a `stamped` label value for every run, so evaluation order shows.
fn stamping() -> ScriptedRunner {
    ScriptedRunner::new()
        .with("example.com/fns/stamp:v1", |list| {
            for item in list.items.iter_mut().filter(|r| !r.is_kptfile()) {
                let prev = item.label("stamped").unwrap_or_default().to_string();
                item.set_label("stamped", &format!("{}x", prev));
            }
            Ok(())
        })
        .with("example.com/fns/check:v1", |list| {
            for item in list.items.iter_mut() {
                item.set_label("validator", "touched");
            }
            Ok(())
        })
}

fn runtime(runner: ScriptedRunner) -> (FnRuntime, Arc<ScriptedRunner>) {
    let runner = Arc::new(runner);
    (FnRuntime::new(runner.clone(), Duration::from_secs(5)), runner)
}

fn labels_of(files: &FileSet, name: &str, key: &str) -> Option<String> {
    read_resources(files, &ReadOptions { include_subpackages: true, ..Default::default() })
        .unwrap()
        .into_iter()
        .find(|r| r.name() == Some(name))
        .and_then(|r| r.label(key).map(str::to_string))
}

#[tokio::test]
async fn subpackages_render_before_parents() {
    let (rt, runner) = runtime(stamping());
    let (out, status) = render(&rt, &package(), &CancellationToken::new()).await.unwrap();

    // The subpackage's resources pass through both pipelines.
    assert_eq!(labels_of(&out, "sub-cm", "stamped").as_deref(), Some("xx"));
    assert_eq!(labels_of(&out, "root-cm", "stamped").as_deref(), Some("x"));
    assert_eq!(status.steps.len(), 3);
    assert_eq!(status.steps[0].package, "sub");
    assert_eq!(runner.calls().len(), 3);
}

#[tokio::test]
async fn validators_do_not_change_content() {
    let (rt, _) = runtime(stamping());
    let (out, _) = render(&rt, &package(), &CancellationToken::new()).await.unwrap();
    assert_eq!(labels_of(&out, "root-cm", "validator"), None);
}

#[tokio::test]
async fn untouched_files_keep_their_text() {
    let runner = ScriptedRunner::new().with("example.com/fns/stamp:v1", |_| Ok(())).with("example.com/fns/check:v1", |_| Ok(()));
    let (rt, _) = runtime(runner);
    let input = package();
    let (out, _) = render(&rt, &input, &CancellationToken::new()).await.unwrap();
    for (path, bytes) in input.iter() {
        assert_eq!(out.get(path), Some(bytes), "{} changed", path);
    }
}

#[tokio::test]
async fn rendering_twice_is_stable_for_idempotent_functions() {
    let runner = ScriptedRunner::new()
        .with("example.com/fns/stamp:v1", |list| {
            for item in list.items.iter_mut().filter(|r| !r.is_kptfile()) {
                item.set_label("team", "blue");
            }
            Ok(())
        })
        .with("example.com/fns/check:v1", |_| Ok(()));
    let (rt, _) = runtime(runner);
    let (once, _) = render(&rt, &package(), &CancellationToken::new()).await.unwrap();
    let (twice, _) = render(&rt, &once, &CancellationToken::new()).await.unwrap();
    assert_eq!(once, twice);
    assert!(once.get_str("cm.yaml").unwrap().contains("# keep me"));
}

#[tokio::test]
async fn error_results_abort_the_pipeline() {
    let runner = ScriptedRunner::new()
        .with("example.com/fns/stamp:v1", |_| Ok(()))
        .with("example.com/fns/check:v1", |list| {
            list.results.push(FnResult { message: "replicas must be set".into(), severity: Severity::Error, ..Default::default() });
            Ok(())
        });
    let (rt, _) = runtime(runner);
    let err = render(&rt, &package(), &CancellationToken::new()).await.unwrap_err();
    assert!(err.is(ErrorKind::InvalidParam));
    assert!(err.message().contains("replicas must be set"));
}

#[tokio::test]
async fn cancelled_render_stops_before_running_functions() {
    let (rt, runner) = runtime(stamping());
    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(render(&rt, &package(), &cancel).await.is_err());
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn render_needs_a_root_kptfile() {
    let (rt, _) = runtime(stamping());
    let mut f = FileSet::new();
    f.insert("cm.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: c\n");
    let err = render(&rt, &f, &CancellationToken::new()).await.unwrap_err();
    assert!(err.is(ErrorKind::NotFound));
}

#[tokio::test]
async fn config_path_resolves_inside_the_package() {
    let kptfile = "apiVersion: kpt.dev/v1
kind: Kptfile
metadata:
  name: root
pipeline:
  mutators:
    - image: ghcr.io/kptdev/krm-functions-catalog/set-namespace:v0.4.1
      configPath: ns-config.yaml
";
    let mut f = FileSet::new();
    f.insert("Kptfile", kptfile);
    f.insert(
        "ns-config.yaml",
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: ns-config\n  annotations:\n    config.kubernetes.io/local-config: \"true\"\ndata:\n  namespace: prod\n",
    );
    f.insert("deploy.yaml", "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\nspec:\n  replicas: 1\n");
    let rt = FnRuntime::new(Arc::new(BuiltinRunner::new()), Duration::from_secs(5));
    let (out, _) = render(&rt, &f, &CancellationToken::new()).await.unwrap();
    assert!(out.get_str("deploy.yaml").unwrap().contains("namespace: prod"));
    assert_eq!(out.get_str("ns-config.yaml"), f.get_str("ns-config.yaml"));
}

#[tokio::test]
async fn eval_runs_one_function_and_spares_kptfiles() {
    let rt = FnRuntime::new(Arc::new(BuiltinRunner::new()), Duration::from_secs(5));
    let mut func = Function::image("ghcr.io/kptdev/krm-functions-catalog/set-labels:v0.2.0");
    func.config_map = Some([("app".to_string(), "web".to_string())].into_iter().collect());
    let input = package();
    let (out, _) = eval(&rt, &input, &func, &CancellationToken::new()).await.unwrap();
    assert_eq!(labels_of(&out, "root-cm", "app").as_deref(), Some("web"));
    assert_eq!(labels_of(&out, "sub-cm", "app").as_deref(), Some("web"));
    assert_eq!(out.get_str("Kptfile"), input.get_str("Kptfile"));
}
