//! Pipeline evaluation (`render`) and single-function evaluation (`eval`).
//!
//! Render is depth-first: each subpackage is rendered before its parent, and
//! the parent's pipeline sees its own resources plus the rendered output of
//! its subpackages. Mutators run first, then validators, in listed order.
//! Validators never change content.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use kpt_core::{check_cancelled, CancellationToken, Error, Result, KPTFILE_NAME};
use kpt_pkg::io::default_path;
use kpt_pkg::{replace_resources, read_resources, FileSet, Function, Kptfile, ReadOptions};
use kpt_yaml::{Node, Resource};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::resourcelist::{FnResult, ResourceList};
use crate::{FnRuntime, FunctionSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Mutator,
    Validator,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Package directory relative to the root; empty for the root.
    pub package: String,
    pub function: String,
    pub stage: Stage,
    pub results: Vec<FnResult>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenderStatus {
    pub steps: Vec<StepResult>,
}

fn join(dir: &str, rel: &str) -> String {
    if dir.is_empty() {
        rel.to_string()
    } else {
        format!("{}/{}", dir, rel)
    }
}

fn postorder(files: &FileSet, dir: &str, out: &mut Vec<String>) {
    for child in files.child_packages(dir) {
        postorder(files, &child, out);
    }
    out.push(dir.to_string());
}

fn read_all(files: &FileSet) -> Result<Vec<Resource>> {
    read_resources(files, &ReadOptions { include_subpackages: true, ..Default::default() })
}

/// `configMap` becomes a synthesized ConfigMap; `configPath` names a
/// resource of the package.
fn function_config(f: &Function, dir: &str, resources: &[Resource]) -> Result<Option<Resource>> {
    if let Some(data) = &f.config_map {
        let mut cm = Resource::new("v1", "ConfigMap", "function-input");
        let mut d = Node::mapping();
        for (k, v) in data {
            d.set(k, Node::string(v.clone()));
        }
        cm.root_mut().set("data", d);
        return Ok(Some(cm));
    }
    let Some(rel) = &f.config_path else {
        return Ok(None);
    };
    let path = join(dir, rel);
    resources
        .iter()
        .find(|r| r.path_annotation() == Some(path.as_str()))
        .map(|r| Some(r.without_internal_annotations()))
        .ok_or_else(|| Error::not_found(format!("function config {} not found in package", path)))
}

/// Reuses input resources the function left untouched so their source text
/// is written back unchanged, and places new resources in `dir`.
fn reconcile(dir: &str, input: &[Resource], output: Vec<Resource>) -> Vec<Resource> {
    let by_location: HashMap<(String, usize), &Resource> = input
        .iter()
        .filter_map(|r| Some(((r.path_annotation()?.to_string(), r.index_annotation().unwrap_or(0)), r)))
        .collect();
    let mut next_index: BTreeMap<String, usize> = BTreeMap::new();
    output
        .into_iter()
        .map(|mut r| {
            match r.path_annotation().map(str::to_string) {
                Some(path) => {
                    let key = (path, r.index_annotation().unwrap_or(0));
                    if let Some(orig) = by_location.get(&key) {
                        if orig.root() == r.root() {
                            return (*orig).clone();
                        }
                    }
                }
                None => {
                    let path = join(dir, &default_path(&r));
                    let index = next_index.entry(path.clone()).or_insert(0);
                    r.set_location(&path, *index);
                    *index += 1;
                }
            }
            r
        })
        .collect()
}

impl FnRuntime {
    async fn step(
        &self,
        dir: &str,
        f: &Function,
        items: Vec<Resource>,
        cancel: &CancellationToken,
    ) -> Result<(Vec<Resource>, Vec<FnResult>)> {
        check_cancelled(cancel, "fn.render")?;
        f.validate().map_err(|e| e.with_op("fn.render"))?;
        let config = function_config(f, dir, &items)?;
        let list = ResourceList::new(items, config);
        let out = self.run(&FunctionSpec::from(f), &list, cancel).await?;
        if let Some(first) = out.errors().next() {
            return Err(Error::invalid_param(format!("function {} failed: {}", f.display_name(), first)).with_op("fn.render"));
        }
        Ok((reconcile(dir, &list.items, out.items), out.results))
    }
}

/// Evaluates every package's pipeline and returns the rendered files.
pub async fn render(rt: &FnRuntime, files: &FileSet, cancel: &CancellationToken) -> Result<(FileSet, RenderStatus)> {
    let t0 = Instant::now();
    if !files.contains(KPTFILE_NAME) {
        return Err(Error::not_found("render needs a package with a Kptfile at its root").with_op("fn.render"));
    }
    let mut own: BTreeMap<String, Vec<Resource>> = BTreeMap::new();
    for r in read_all(files)? {
        let owner = files.owning_package(r.path_annotation().unwrap_or_default());
        own.entry(owner).or_default().push(r);
    }
    let mut order = Vec::new();
    postorder(files, "", &mut order);

    let mut status = RenderStatus::default();
    let mut rendered: BTreeMap<String, Vec<Resource>> = BTreeMap::new();
    for dir in &order {
        let mut items = own.remove(dir).unwrap_or_default();
        for child in files.child_packages(dir) {
            items.extend(rendered.remove(&child).unwrap_or_default());
        }
        let kptfile = Kptfile::from_resource(
            items
                .iter()
                .find(|r| r.is_kptfile() && r.path_annotation() == Some(join(dir, KPTFILE_NAME).as_str()))
                .ok_or_else(|| Error::not_found(format!("package {:?} has no Kptfile", dir)))?,
        )
        .map_err(|e| e.with_path(join(dir, KPTFILE_NAME)))?;
        let pipeline = kptfile.pipeline.unwrap_or_default();

        for f in &pipeline.mutators {
            let (out, results) = rt.step(dir, f, items, cancel).await.map_err(|e| e.with_path(join(dir, KPTFILE_NAME)))?;
            items = out;
            status.steps.push(StepResult { package: dir.clone(), function: f.display_name().to_string(), stage: Stage::Mutator, results });
        }
        for f in &pipeline.validators {
            let (_, results) = rt.step(dir, f, items.clone(), cancel).await.map_err(|e| e.with_path(join(dir, KPTFILE_NAME)))?;
            status.steps.push(StepResult { package: dir.clone(), function: f.display_name().to_string(), stage: Stage::Validator, results });
        }
        debug!(package = %dir, resources = items.len(), "rendered package");
        rendered.insert(dir.clone(), items);
    }

    let out_resources = rendered.remove("").unwrap_or_default();
    let mut out = files.clone();
    replace_resources(&mut out, &out_resources, &ReadOptions { include_subpackages: true, ..Default::default() })?;
    histogram!("kpt_fn_render_ms", t0.elapsed().as_secs_f64() * 1000.0);
    counter!("kpt_fn_render_total", 1u64);
    info!(packages = order.len(), steps = status.steps.len(), took_ms = %t0.elapsed().as_millis(), "rendered");
    Ok((out, status))
}

/// Runs one function over every resource of the package, Kptfiles excluded,
/// and returns the updated files together with the function's results.
pub async fn eval(rt: &FnRuntime, files: &FileSet, f: &Function, cancel: &CancellationToken) -> Result<(FileSet, Vec<FnResult>)> {
    let (meta, items): (Vec<Resource>, Vec<Resource>) = read_all(files)?.into_iter().partition(Resource::is_kptfile);
    let (mut out_items, results) = rt.step("", f, items, cancel).await.map_err(|e| e.with_op("fn.eval"))?;
    out_items.extend(meta);
    let mut out = files.clone();
    replace_resources(&mut out, &out_items, &ReadOptions { include_subpackages: true, ..Default::default() })?;
    counter!("kpt_fn_eval_total", 1u64);
    Ok((out, results))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postorder_visits_children_first() {
        let mut f = FileSet::new();
        f.insert("Kptfile", "x");
        f.insert("a/Kptfile", "x");
        f.insert("a/b/Kptfile", "x");
        f.insert("c/Kptfile", "x");
        let mut order = Vec::new();
        postorder(&f, "", &mut order);
        assert_eq!(order, vec!["a/b", "a", "c", ""]);
    }

    #[test]
    fn new_resources_land_in_the_package_dir() {
        let out = reconcile("sub", &[], vec![Resource::new("v1", "ConfigMap", "extra")]);
        assert_eq!(out[0].path_annotation(), Some("sub/configmap_extra.yaml"));
    }
}
