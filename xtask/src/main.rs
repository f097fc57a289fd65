use std::{
    env,
    path::{Path, PathBuf},
    process::{self, Command},
};

#[macro_use]
extern crate clap;

const DEFAULT_TARGET: &'static str = "riscv64imac-unknown-none-elf";
const PACKAGE: &'static str = "virtio-pci";

fn main() {
    let matches = clap_app!(xtask =>
        (version: crate_version!())
        (author: crate_authors!())
        (about: crate_description!())
        (@subcommand build =>
            (about: "Build the driver core for a bare-metal target")
            (@arg target: --target +takes_value "Target triple, defaults to riscv64imac-unknown-none-elf")
        )
        (@subcommand test =>
            (about: "Run unit and integration tests against the simulated device")
        )
        (@subcommand doc =>
            (about: "Build crate documentation")
        )
    ).get_matches();
    if let Some(matches) = matches.subcommand_matches("build") {
        xtask_build(matches.value_of("target").unwrap_or(DEFAULT_TARGET));
    } else if let Some(_matches) = matches.subcommand_matches("test") {
        xtask_test();
    } else if let Some(_matches) = matches.subcommand_matches("doc") {
        xtask_doc();
    } else {
        println!("Use `cargo xtask test` to test, `cargo xtask --help` for help")
    }
}

fn cargo() -> Command {
    let cargo = env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());
    let mut command = Command::new(cargo);
    command.current_dir(project_root());
    command
}

fn run(mut command: Command, what: &str) {
    let status = match command.status() {
        Ok(status) => status,
        Err(err) => {
            println!("{} could not start: {}", what, err);
            process::exit(1);
        }
    };
    if !status.success() {
        println!("{} failed", what);
        process::exit(1);
    }
}

fn xtask_build(target: &str) {
    let mut command = cargo();
    command
        .args(&["build", "--release"])
        .args(&["--package", PACKAGE])
        .args(&["--target", target]);
    run(command, "cargo build");
}

fn xtask_test() {
    let mut command = cargo();
    command.args(&["test", "--package", PACKAGE]);
    run(command, "cargo test");
}

fn xtask_doc() {
    let mut command = cargo();
    command.args(&["doc", "--no-deps", "--package", PACKAGE]);
    run(command, "cargo doc");
}

fn project_root() -> PathBuf {
    Path::new(&env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(1)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}
