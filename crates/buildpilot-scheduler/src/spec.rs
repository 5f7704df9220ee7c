//! Pure rendering of a job configuration into Nomad batch-job specifications.
//!
//! Kept free of any HTTP client so the shape of each phase's spec can be
//! tested without a live cluster.

use buildpilot_core::{JobConfig, JobId, Phase, ResourceSpec, resolve_resources};
use serde_json::{Value, json};
use std::collections::HashMap;

/// Name Nomad registers the job under; also used to derive the dispatch URL.
pub fn job_name(phase: Phase, job_id: JobId) -> String {
    format!("{}-{}", phase.as_str(), job_id)
}

/// `<registry>/bdtemp-<image>:<branch>-<job_id>`, the coordinate the build
/// phase pushes to and the test/publish phases pull from.
pub fn intermediate_image(config: &JobConfig, job_id: JobId) -> String {
    format!(
        "{}/bdtemp-{}:{}-{}",
        config.registry_url.trim_end_matches('/'),
        config.image_name,
        sanitize_branch(&config.git_ref),
        job_id
    )
}

fn sanitize_branch(git_ref: &str) -> String {
    git_ref.replace('/', "-")
}

fn default_resources() -> ResourceSpec {
    ResourceSpec {
        cpu: Some("500".to_string()),
        memory: Some("512".to_string()),
        disk: Some("1024".to_string()),
    }
}

fn resources_block(phase: Phase, config: &JobConfig) -> Value {
    let resolved = resolve_resources(phase, config.resource_limits.as_ref(), &default_resources());
    let parse_mib = |s: &Option<String>, fallback: i64| -> i64 {
        s.as_deref()
            .and_then(|v| v.trim_end_matches("Mi").parse::<i64>().ok())
            .unwrap_or(fallback)
    };
    json!({
        "CPU": parse_mib(&resolved.cpu, 500),
        "MemoryMB": parse_mib(&resolved.memory, 512),
        "DiskMB": parse_mib(&resolved.disk, 1024),
    })
}

fn secret_template(secret_path: &str, env_var: &str, field: &str) -> Value {
    json!({
        "DestPath": format!("secrets/{env_var}.env"),
        "EnvVars": true,
        "EmbeddedTmpl": format!(
            "{{{{ with secret \"{secret_path}\" }}}}{env_var}={{{{ .Data.data.{field} }}}}{{{{ end }}}}"
        ),
    })
}

/// Render the build-phase job spec: clones `git_ref`, builds `dockerfile_path`
/// with Buildah in rootless mode, tags and pushes the intermediate image.
/// The runner reports the commit it resolved `git_ref` to as a
/// `GIT_COMMIT_SHA=<sha>` line on stdout.
pub fn build_spec(config: &JobConfig, job_id: JobId, datacenter: &str) -> Value {
    let image = intermediate_image(config, job_id);
    let args = vec![
        "build-push".to_string(),
        "--repo".to_string(),
        config.repo_url.clone(),
        "--ref".to_string(),
        config.git_ref.clone(),
        "--dockerfile".to_string(),
        config.dockerfile_path.clone(),
        "--tag".to_string(),
        image,
    ];
    batch_job(
        job_name(Phase::Build, job_id),
        datacenter,
        args,
        resources_block(Phase::Build, config),
        vec![
            secret_template(&config.git_credentials_ref, "GIT_TOKEN", "token"),
            secret_template(&config.registry_credentials_ref, "REGISTRY_AUTH", "auth"),
        ],
        &HashMap::new(),
        None,
    )
}

/// Render the test-phase job spec. Absent when `test` is skipped.
pub fn test_spec(config: &JobConfig, job_id: JobId, datacenter: &str) -> Option<Value> {
    let test = config.test.as_ref()?;
    if test.is_skipped() {
        return None;
    }
    let image = intermediate_image(config, job_id);
    let mut args = vec!["test".to_string(), "--image".to_string(), image];
    if test.entry_point {
        args.push("--entry-point".to_string());
    }
    for cmd in &test.commands {
        args.push("--command".to_string());
        args.push(cmd.clone());
    }

    let mut templates = vec![secret_template(
        &config.registry_credentials_ref,
        "REGISTRY_AUTH",
        "auth",
    )];
    for binding in &test.secret_bindings {
        for (field, env_var) in &binding.env {
            templates.push(secret_template(&binding.path, env_var, field));
        }
    }

    // Every binding's template needs the task authenticated against Vault
    // under the caller-declared policies, or its `{{ with secret ... }}`
    // stanza can't read anything.
    let vault = (!test.secret_bindings.is_empty())
        .then(|| json!({ "Policies": test.secret_policies }));

    Some(batch_job(
        job_name(Phase::Test, job_id),
        datacenter,
        args,
        resources_block(Phase::Test, config),
        templates,
        &test.env,
        vault,
    ))
}

/// Render the publish-phase job spec: re-tags the intermediate image under
/// every configured tag (or `[job_id]` if none were given) and pushes each.
pub fn publish_spec(config: &JobConfig, job_id: JobId, datacenter: &str) -> Value {
    let image = intermediate_image(config, job_id);
    let mut args = vec!["publish".to_string(), "--source".to_string(), image];
    for tag in config.resolve_tags(job_id) {
        args.push("--dest".to_string());
        args.push(format!("{}/{}:{}", config.registry_url, config.image_name, tag));
    }
    batch_job(
        job_name(Phase::Publish, job_id),
        datacenter,
        args,
        resources_block(Phase::Publish, config),
        vec![secret_template(
            &config.registry_credentials_ref,
            "REGISTRY_AUTH",
            "auth",
        )],
        &HashMap::new(),
        None,
    )
}

/// Render a short-lived job that deletes an intermediate `bdtemp-` image
/// from the registry. Best-effort cleanup, not on the pipeline's critical
/// path: its own resource footprint is minimal and fixed.
pub fn cleanup_image_spec(name: &str, image_ref: &str, datacenter: &str) -> Value {
    batch_job(
        name.to_string(),
        datacenter,
        vec!["delete-image".to_string(), "--tag".to_string(), image_ref.to_string()],
        json!({ "CPU": 100, "MemoryMB": 128, "DiskMB": 256 }),
        Vec::new(),
        &HashMap::new(),
        None,
    )
}

fn batch_job(
    name: String,
    datacenter: &str,
    args: Vec<String>,
    resources: Value,
    templates: Vec<Value>,
    env: &HashMap<String, String>,
    vault: Option<Value>,
) -> Value {
    let mut task = json!({
        "Name": "pipeline",
        "Driver": "docker",
        "Config": {
            "image": "buildpilot/buildah-runner:latest",
            "args": args,
            "privileged": false,
        },
        "Templates": templates,
        "Env": env,
        "Resources": resources,
    });
    if let Some(vault) = vault {
        task.as_object_mut().unwrap().insert("Vault".to_string(), vault);
    }
    json!({
        "Job": {
            "ID": name,
            "Name": name,
            "Type": "batch",
            "Datacenters": [datacenter],
            "TaskGroups": [{
                "Name": "pipeline",
                "Count": 1,
                "RestartPolicy": { "Attempts": 0, "Mode": "fail" },
                "Tasks": [task],
            }],
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildpilot_core::TestConfig;
    use std::collections::HashMap;

    fn config() -> JobConfig {
        JobConfig {
            owner: "acme".into(),
            repo_url: "https://git.example/acme/app.git".into(),
            git_ref: "feature/x".into(),
            git_credentials_ref: "secret/git/acme".into(),
            dockerfile_path: "Dockerfile".into(),
            image_name: "app".into(),
            image_tags: vec![],
            registry_url: "registry.example.com".into(),
            registry_credentials_ref: "secret/registry/acme".into(),
            test: None,
            resource_limits: None,
            webhook: None,
        }
    }

    #[test]
    fn intermediate_image_sanitizes_branch_slashes() {
        let job_id = JobId::new();
        let image = intermediate_image(&config(), job_id);
        assert_eq!(
            image,
            format!("registry.example.com/bdtemp-app:feature-x-{job_id}")
        );
    }

    #[test]
    fn test_spec_is_none_when_skipped() {
        let mut cfg = config();
        cfg.test = Some(TestConfig::default());
        assert!(test_spec(&cfg, JobId::new(), "dc1").is_none());
    }

    #[test]
    fn test_spec_mounts_secret_bindings() {
        let mut cfg = config();
        cfg.test = Some(TestConfig {
            commands: vec!["pytest".into()],
            entry_point: false,
            env: HashMap::new(),
            secret_policies: vec!["read-only".into()],
            secret_bindings: vec![buildpilot_core::SecretBinding {
                path: "secret/app/db".into(),
                env: HashMap::from([("password".to_string(), "DB_PASSWORD".to_string())]),
            }],
        });
        let spec = test_spec(&cfg, JobId::new(), "dc1").unwrap();
        let task = &spec["Job"]["TaskGroups"][0]["Tasks"][0];
        let templates = task["Templates"].as_array().unwrap();
        assert_eq!(templates.len(), 2);
        assert_eq!(
            task["Vault"]["Policies"].as_array().unwrap(),
            &vec![Value::String("read-only".into())]
        );
    }

    #[test]
    fn test_spec_renders_configured_env_vars() {
        let mut cfg = config();
        cfg.test = Some(TestConfig {
            commands: vec!["pytest".into()],
            env: HashMap::from([("PYTHONPATH".to_string(), "/app".to_string())]),
            ..Default::default()
        });
        let spec = test_spec(&cfg, JobId::new(), "dc1").unwrap();
        let task = &spec["Job"]["TaskGroups"][0]["Tasks"][0];
        assert_eq!(task["Env"]["PYTHONPATH"].as_str(), Some("/app"));
        assert!(task.get("Vault").is_none(), "no bindings means no Vault stanza");
    }

    #[test]
    fn publish_spec_defaults_tag_to_job_id() {
        let job_id = JobId::new();
        let spec = publish_spec(&config(), job_id, "dc1");
        let args = spec["Job"]["TaskGroups"][0]["Tasks"][0]["Config"]["args"]
            .as_array()
            .unwrap();
        assert!(args.iter().any(|a| a.as_str() == Some(&format!(
            "registry.example.com/app:{job_id}"
        ))));
    }
}
