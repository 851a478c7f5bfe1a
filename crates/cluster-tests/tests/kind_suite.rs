//! Live suite against a real cluster.
//!
//! Runs with its own `main` so that the environment's `Setup` and `Finish`
//! hooks wrap every test exactly once.

use cluster_tests::fixtures::NamespaceFixture;
use cluster_tests::suite::{build_environment, select_tests};
use e2e_framework::wait::{self, WaitOptions};
use e2e_framework::{logging, Context, Environment, FeatureBuilder, TestHandle, TestSuite};
use e2e_providers::ProviderRegistry;
use std::collections::HashMap;
use std::process;
use std::time::Duration;

fn api_server_ready(ctx: Context, t: &mut TestHandle, cfg: &e2e_framework::Config) -> Context {
    let client = match cfg.client() {
        Ok(client) => client,
        Err(err) => {
            t.fatal(format!("no client: {err}"));
            return ctx;
        }
    };
    let opts = WaitOptions::new()
        .with_interval(Duration::from_secs(1))
        .with_timeout(Duration::from_secs(120));
    let ready = wait::for_condition_with_context(&ctx, &opts, || Ok(client.check_ready().is_ok()));
    if let Err(err) = ready {
        t.error(format!("API server never became ready: {err}"));
    }
    ctx
}

fn test_cluster_health(env: &mut Environment, t: &mut TestHandle) {
    let feature = FeatureBuilder::new("cluster health")
        .with_label("type", "smoke")
        .assess("api server is ready", api_server_ready)
        .assess("default namespace exists", |ctx, t, cfg| {
            let result = cfg
                .client()
                .map_err(anyhow::Error::from)
                .and_then(|c| c.get_json("/api/v1/namespaces/default").map_err(Into::into));
            match result {
                Ok(ns) => {
                    let name = ns.pointer("/metadata/name").and_then(|n| n.as_str());
                    if name != Some("default") {
                        t.error(format!("unexpected namespace object: {ns}"));
                    }
                }
                Err(err) => t.error(format!("{err:#}")),
            }
            ctx
        })
        .feature();
    env.test(t, &[feature]);
}

fn test_namespace_per_test(env: &mut Environment, t: &mut TestHandle) {
    let feature = FeatureBuilder::new("namespace per test")
        .assess("namespace is active", |ctx, t, cfg| {
            let ns = cfg.namespace().to_string();
            t.log(format!("checking namespace {ns}"));
            let client = match cfg.client() {
                Ok(client) => client,
                Err(err) => {
                    t.fatal(err.to_string());
                    return ctx;
                }
            };
            let opts = WaitOptions::new().with_timeout(Duration::from_secs(60));
            let path = format!("/api/v1/namespaces/{ns}");
            let active = wait::for_resource(&client, &path, &opts, |obj| {
                obj.pointer("/status/phase").and_then(|p| p.as_str()) == Some("Active")
            });
            if let Err(err) = active {
                t.error(format!("namespace {ns} not active: {err}"));
            }
            ctx
        })
        .feature();
    env.test(t, &[feature]);
}

fn main() {
    logging::init();

    let vars: HashMap<String, String> = std::env::vars().collect();
    let registry = ProviderRegistry::with_defaults();

    let mut env = match build_environment(&registry) {
        Ok(env) => env,
        Err(err) => {
            eprintln!("failed to build environment: {err:#}");
            process::exit(1);
        }
    };
    let namespaces = NamespaceFixture::new("e2e");
    env.before_each_test([namespaces.before_each_test()])
        .after_each_test([namespaces.after_each_test()]);

    let suite = TestSuite::new()
        .test("TestClusterHealth", test_cluster_health)
        .test("TestNamespacePerTest", test_namespace_per_test);
    let suite = match select_tests(suite, &vars) {
        Ok(suite) => suite,
        Err(err) => {
            eprintln!("invalid {}: {err}", cluster_tests::suite::ENV_RUN);
            process::exit(1);
        }
    };

    env.run_and_exit(|env| {
        let report = suite.run_tests(env);
        for test in &report.tests {
            println!("{}", test.render());
        }
        report.exit_code()
    });
}
