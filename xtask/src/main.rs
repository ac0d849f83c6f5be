//! Build helper for the workspace, run as `cargo xtask <task>`.
//!
//! Tasks declare what must run before them. A task runs only after all of
//! its prerequisites succeeded, and the first failure stops the run.

use std::{
    env,
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
    process::Command,
};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

const APP: &str = "saxpy-app";
const SHADER_EXT: &str = "comp";

/// Output file suffix and the extra `glslc` flags for each SPIR-V flavour.
const SHADER_VARIANTS: [(&str, &str); 2] = [("spv", "-O"), ("debug.spv", "-g")];

fn main() {
    if let Err(e) = try_main() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let Some(name) = env::args().nth(1) else {
        eprintln!("Usage: cargo xtask <task>\n\nTasks:");
        for task in Task::ALL {
            eprintln!("  {:<10} {}", task.name(), task.about());
        }
        std::process::exit(1);
    };
    let workspace = Workspace::locate()?;
    for task in plan(Task::parse(&name)?) {
        println!("==> {}", task.name());
        task.run(&workspace)
            .map_err(|e| format!("task `{}` failed: {e}", task.name()))?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    Shaders,
    Test,
    App,
    Dist,
}

impl Task {
    const ALL: [Task; 4] = [Task::Shaders, Task::Test, Task::App, Task::Dist];

    fn name(self) -> &'static str {
        match self {
            Task::Shaders => "shaders",
            Task::Test => "test",
            Task::App => "app",
            Task::Dist => "dist",
        }
    }

    fn about(self) -> &'static str {
        match self {
            Task::Shaders => "compile GLSL compute shaders to out/shaders",
            Task::Test => "run the workspace tests against the compiled shader",
            Task::App => "build the saxpy demo",
            Task::Dist => "collect the demo and its shaders in out/",
        }
    }

    fn parse(name: &str) -> Result<Self> {
        Task::ALL
            .into_iter()
            .find(|t| t.name() == name)
            .ok_or_else(|| format!("unknown task: `{name}`").into())
    }

    fn prerequisites(self) -> &'static [Task] {
        match self {
            Task::Shaders | Task::App => &[],
            Task::Test => &[Task::Shaders],
            Task::Dist => &[Task::App, Task::Shaders],
        }
    }

    fn run(self, ws: &Workspace) -> Result<()> {
        match self {
            Task::Shaders => compile_shaders(ws),
            Task::Test => check(
                ws.cargo(["test", "--workspace"])
                    .env("RCOMPUTE_SAXPY_SPV", ws.shader_out().join("saxpy.spv")),
            ),
            Task::App => check(&mut ws.cargo(["build", "-p", APP])),
            Task::Dist => copy_app(ws),
        }
    }
}

/// `target` and everything it depends on, prerequisites first, each once.
fn plan(target: Task) -> Vec<Task> {
    fn visit(task: Task, out: &mut Vec<Task>) {
        if out.contains(&task) {
            return;
        }
        for &dep in task.prerequisites() {
            visit(dep, out);
        }
        out.push(task);
    }
    let mut out = Vec::new();
    visit(target, &mut out);
    out
}

struct Workspace {
    root: PathBuf,
    cargo: OsString,
}

impl Workspace {
    fn locate() -> Result<Self> {
        let root = Path::new(env!("CARGO_MANIFEST_DIR"))
            .parent()
            .ok_or("xtask manifest has no parent directory")?
            .to_path_buf();
        Ok(Self {
            root,
            cargo: env::var_os("CARGO").unwrap_or_else(|| "cargo".into()),
        })
    }

    fn shader_src(&self) -> PathBuf {
        self.root.join(APP).join("shaders")
    }

    fn shader_out(&self) -> PathBuf {
        self.root.join("out").join("shaders")
    }

    fn cargo<const N: usize>(&self, args: [&str; N]) -> Command {
        let mut cmd = Command::new(&self.cargo);
        cmd.args(args).current_dir(&self.root);
        cmd
    }
}

/// True when `dst` is missing or older than `src`.
fn is_stale(src: &Path, dst: &Path) -> bool {
    let modified = |p: &Path| fs::metadata(p).and_then(|m| m.modified()).ok();
    match (modified(src), modified(dst)) {
        (Some(src), Some(dst)) => src > dst,
        _ => true,
    }
}

fn check(cmd: &mut Command) -> Result<()> {
    let status = cmd.status()?;
    if status.success() {
        Ok(())
    } else {
        Err(format!("{:?} exited with {status}", cmd.get_program()).into())
    }
}

fn compile_shaders(ws: &Workspace) -> Result<()> {
    let out_dir = ws.shader_out();
    fs::create_dir_all(&out_dir)?;

    let mut sources: Vec<PathBuf> = fs::read_dir(ws.shader_src())?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<_>>()?;
    sources.retain(|p| p.extension().is_some_and(|ext| ext == SHADER_EXT));
    sources.sort();

    let mut compiled = 0;
    for src in &sources {
        let stem = src
            .file_stem()
            .ok_or_else(|| format!("shader without a file name: {src:?}"))?
            .to_string_lossy();
        for (suffix, flag) in SHADER_VARIANTS {
            let dst = out_dir.join(format!("{stem}.{suffix}"));
            if !is_stale(src, &dst) {
                continue;
            }
            println!("glslc {} -> {}", src.display(), dst.display());
            check(
                Command::new("glslc")
                    .args(["-fshader-stage=compute", "--target-env=vulkan1.0", flag])
                    .arg("-o")
                    .arg(&dst)
                    .arg(src),
            )?;
            compiled += 1;
        }
    }
    println!(
        "{} shader(s), {compiled} output(s) rebuilt",
        sources.len()
    );
    Ok(())
}

fn copy_app(ws: &Workspace) -> Result<()> {
    let out_dir = ws.root.join("out");
    fs::create_dir_all(&out_dir)?;
    let exe = format!("{APP}{}", env::consts::EXE_SUFFIX);
    let src = ws.root.join("target").join("debug").join(&exe);
    let dst = out_dir.join(&exe);
    if is_stale(&src, &dst) {
        fs::copy(&src, &dst)?;
        println!("copied {exe} to {}", out_dir.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_puts_prerequisites_first_once() {
        assert_eq!(plan(Task::Dist), vec![Task::App, Task::Shaders, Task::Dist]);
        assert_eq!(plan(Task::Test), vec![Task::Shaders, Task::Test]);
        assert_eq!(plan(Task::Shaders), vec![Task::Shaders]);
    }

    #[test]
    fn every_task_parses_by_name() {
        for task in Task::ALL {
            assert_eq!(Task::parse(task.name()).ok(), Some(task));
        }
        assert!(Task::parse("deploy").is_err());
    }

    #[test]
    fn missing_output_is_stale() {
        let dir = env::temp_dir().join(format!("xtask-stale-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let src = dir.join("a.comp");
        fs::write(&src, "void main() {}").unwrap();

        assert!(is_stale(&src, &dir.join("a.spv")));
        assert!(!is_stale(&src, &src));
        assert!(is_stale(&dir.join("missing.comp"), &src));

        fs::remove_dir_all(&dir).unwrap();
    }
}
