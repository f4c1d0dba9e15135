use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, RwLock};

use crate::error::HookError;
use crate::models::backup_task::{BackupHook, BackupTask, HookPhase};

/// Environment handed to a hook.
#[derive(Debug, Clone)]
pub struct HookEnv {
    pub backup_dest: PathBuf,
    pub phase: HookPhase,
    pub session_temp_dir: Option<PathBuf>,
    pub params: BTreeMap<String, String>,
}

impl HookEnv {
    pub fn vars(&self) -> Vec<(String, String)> {
        let mut vars = vec![
            ("BACKUP_DEST".to_string(), self.backup_dest.display().to_string()),
            ("HOOK_PHASE".to_string(), self.phase.as_str().to_string()),
        ];
        if let Some(dir) = &self.session_temp_dir {
            vars.push(("SESSION_TEMP_DIR".to_string(), dir.display().to_string()));
        }
        for (k, v) in &self.params {
            vars.push((param_var(k), v.clone()));
        }
        vars
    }
}

/// `db-name` -> `HOOK_PARAM_DB_NAME`
pub fn param_var(key: &str) -> String {
    format!("HOOK_PARAM_{}", key.replace('-', "_").to_uppercase())
}

pub trait Hook: Send + Sync {
    fn name(&self) -> &str;
    /// Returns the hook's output on success.
    fn run(&self, env: &HookEnv) -> Result<String, HookError>;
}

/// `<plugin dir>/<name>.sh`, executed with bash.
pub struct ScriptHook {
    name: String,
    path: PathBuf,
}

impl ScriptHook {
    pub fn new(name: impl Into<String>, path: PathBuf) -> Self {
        Self {
            name: name.into(),
            path,
        }
    }
}

impl Hook for ScriptHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, env: &HookEnv) -> Result<String, HookError> {
        let output = Command::new("bash")
            .arg(&self.path)
            .envs(env.vars())
            .output()
            .map_err(|source| HookError::Spawn {
                name: self.name.clone(),
                source,
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        tracing::debug!(hook = %self.name, phase = env.phase.as_str(), stdout = %stdout.trim(), stderr = %stderr.trim(), "Hook finished");

        if !output.status.success() {
            let text = if stderr.trim().is_empty() { &stdout } else { &stderr };
            return Err(HookError::Failed {
                name: self.name.clone(),
                status: output.status.to_string(),
                output: crate::transfer::last_line(text),
            });
        }
        Ok(stdout)
    }
}

/// Hook names are plain file stems inside the plugin directory.
pub fn validate_name(name: &str) -> Result<(), HookError> {
    let ok = !name.is_empty()
        && !name.starts_with('.')
        && !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(HookError::InvalidName(name.to_string()))
    }
}

/// Hooks by name: scripts found in the plugin directory plus any registered in code.
pub struct HookRegistry {
    dir: PathBuf,
    hooks: RwLock<HashMap<String, Arc<dyn Hook>>>,
}

impl HookRegistry {
    pub fn empty(dir: PathBuf) -> Self {
        Self {
            dir,
            hooks: RwLock::new(HashMap::new()),
        }
    }

    /// Scans `dir` for `*.sh` scripts. A missing directory yields an empty registry.
    pub fn load(dir: &Path) -> io::Result<Self> {
        let registry = Self::empty(dir.to_path_buf());
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(dir = %dir.display(), "Plugin directory not found, no hooks loaded");
                return Ok(registry);
            }
            Err(e) => return Err(e),
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("sh") || !path.is_file() {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if validate_name(stem).is_err() {
                tracing::warn!(path = %path.display(), "Skipping hook script with invalid name");
                continue;
            }
            registry.register(Arc::new(ScriptHook::new(stem, path.clone())));
        }
        tracing::info!(dir = %dir.display(), count = registry.names().len(), "Hooks loaded");
        Ok(registry)
    }

    pub fn register(&self, hook: Arc<dyn Hook>) {
        let mut hooks = self.hooks.write().unwrap_or_else(|e| e.into_inner());
        hooks.insert(hook.name().to_string(), hook);
    }

    /// Looks up `name`, picking up scripts added to the plugin directory after load.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Hook>, HookError> {
        validate_name(name)?;
        if let Some(h) = self.hooks.read().unwrap_or_else(|e| e.into_inner()).get(name) {
            return Ok(h.clone());
        }
        let path = self.dir.join(format!("{name}.sh"));
        if path.is_file() && path.starts_with(&self.dir) {
            let hook: Arc<dyn Hook> = Arc::new(ScriptHook::new(name, path));
            self.register(hook.clone());
            return Ok(hook);
        }
        Err(HookError::NotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .hooks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

/// Per-run values shared by every hook of a run.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub backup_dest: PathBuf,
    pub session_temp_dir: Option<PathBuf>,
}

fn run_one(registry: &HookRegistry, hook: &BackupHook, ctx: &HookContext) -> Result<(), HookError> {
    let env = HookEnv {
        backup_dest: ctx.backup_dest.clone(),
        phase: hook.phase,
        session_temp_dir: ctx.session_temp_dir.clone(),
        params: hook.params.clone(),
    };
    tracing::info!(hook = %hook.name, phase = hook.phase.as_str(), "Running hook");
    registry.get(&hook.name)?.run(&env).map(|_| ())
}

/// Enabled pre hooks in order; the first failure stops the run.
pub fn run_pre_hooks(
    registry: &HookRegistry,
    task: &BackupTask,
    ctx: &HookContext,
) -> Result<usize, HookError> {
    let mut ran = 0;
    for hook in task.hooks_for(HookPhase::Pre) {
        run_one(registry, hook, ctx)?;
        ran += 1;
    }
    Ok(ran)
}

/// Enabled post hooks in order. Every hook runs; failures are returned for logging.
pub fn run_post_hooks(registry: &HookRegistry, task: &BackupTask, ctx: &HookContext) -> Vec<HookError> {
    task.hooks_for(HookPhase::Post)
        .filter_map(|hook| run_one(registry, hook, ctx).err())
        .collect()
}
