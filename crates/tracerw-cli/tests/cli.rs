//! Tests bout-en-bout du binaire `tracerw`.

use std::{
    fs,
    path::Path,
    process::{Command, Output},
};

use pretty_assertions::assert_eq;
use tracerw_core::{unit::MAGIC, CodeUnit};

const SOURCE: &str = "
.unit <module> 1
.const int 0
.unit f 2
.const int 1
3: LOAD_NAME 0
   JUMP_IF_FALSE @else
4: LOAD_CONST 0
   RETURN
else:
6: LOAD_CONST 0
   RETURN
.end
2: MAKE_CLOSURE 1
   STORE_NAME 0
8: LOAD_NAME 0
   CALL 0
   RETURN
.end
";

fn tracerw(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_tracerw"))
        .current_dir(dir)
        .env_remove("RUST_LOG")
        .arg("-q")
        .args(args)
        .output()
        .expect("binaire tracerw")
}

fn ok(out: &Output) {
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
}

#[test]
fn assemble_rewrite_verify() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("prog.trasm"), SOURCE).unwrap();

    ok(&tracerw(dir.path(), &["asm", "prog.trasm", "-o", "prog.trut"]));
    let original = fs::read(dir.path().join("prog.trut")).unwrap();
    assert_eq!(&original[..4], MAGIC);

    ok(&tracerw(dir.path(), &["rewrite", "prog.trut", "-o", "a.trut", "--seed", "9"]));
    ok(&tracerw(dir.path(), &["rewrite", "prog.trasm", "-o", "b.trut", "--seed", "9"]));
    let a = fs::read(dir.path().join("a.trut")).unwrap();
    let b = fs::read(dir.path().join("b.trut")).unwrap();
    assert_eq!(a, b, "même graine, même entrée : mêmes octets");

    let before = CodeUnit::from_bytes(&original).unwrap();
    let after = CodeUnit::from_bytes(&a).unwrap();
    assert_eq!(after.tree_len(), before.tree_len());
    assert!(after.code.len() > before.code.len());

    let out = tracerw(dir.path(), &["verify", "a.trut"]);
    ok(&out);
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "OK 2 unit(s)");
}

#[test]
fn dump_lists_probes_and_json() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("prog.trasm"), SOURCE).unwrap();
    ok(&tracerw(dir.path(), &["rewrite", "prog.trasm", "-o", "p.trut", "--seed", "1", "--all"]));

    let out = tracerw(dir.path(), &["dump", "p.trut"]);
    ok(&out);
    let text = String::from_utf8(out.stdout).unwrap();
    assert!(text.contains("== f =="));
    assert!(text.contains("== <module> =="));
    assert!(text.contains("PROBE 0x"));

    let out = tracerw(dir.path(), &["dump", "p.trut", "--json"]);
    ok(&out);
    let json: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(json["name"], "<module>");
    assert_eq!(json["consts"][1]["Code"]["name"], "f");
}

#[test]
fn config_file_is_picked_up_from_parent_dirs() {
    let dir = tempfile::tempdir().unwrap();
    let work = dir.path().join("sub/dir");
    fs::create_dir_all(&work).unwrap();
    fs::write(work.join("prog.trasm"), SOURCE).unwrap();

    // `keep` hors de [0, 1] : la config trouvée doit être rejetée.
    fs::write(dir.path().join(".tracerw.toml"), "[sampling]\nmode = \"bernoulli\"\nkeep = 3.0\n").unwrap();
    let out = tracerw(&work, &["rewrite", "prog.trasm", "-o", "x.trut", "--seed", "1"]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains(".tracerw.toml"));

    // `--config` explicite prend le dessus.
    fs::write(work.join("ok.toml"), "candidates = \"line-starts\"\n").unwrap();
    ok(&tracerw(&work, &["--config", "ok.toml", "rewrite", "prog.trasm", "-o", "x.trut", "--seed", "1"]));
}

#[test]
fn rewrite_failures_name_the_unit() {
    let dir = tempfile::tempdir().unwrap();
    let src = ".unit <module> 1\n.unit gen 2\n3: NOP\n   GEN_START\n.end\n2: MAKE_CLOSURE 0\n.end\n";
    fs::write(dir.path().join("bad.trasm"), src).unwrap();
    let out = tracerw(dir.path(), &["rewrite", "bad.trasm", "-o", "x.trut", "--all"]);
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.starts_with("error:"));
    assert!(stderr.contains("<module>/gen"), "{stderr}");
    assert!(!dir.path().join("x.trut").exists());
}

#[test]
fn unsigned_tables_refuse_backward_lines() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join(".tracerw.toml"), "sign = \"unsigned\"\n").unwrap();
    fs::write(dir.path().join("back.trasm"), ".unit m 1\n3: NOP\n2: RETURN\n.end\n").unwrap();
    fs::write(dir.path().join("fwd.trasm"), ".unit m 1\n3: NOP\n7: RETURN\n.end\n").unwrap();

    for args in [&["asm", "back.trasm", "-o", "b.trut"][..], &["rewrite", "back.trasm", "-o", "b.trut"][..]] {
        let out = tracerw(dir.path(), args);
        assert!(!out.status.success());
        assert!(String::from_utf8_lossy(&out.stderr).contains("asm line 4"));
    }

    ok(&tracerw(dir.path(), &["rewrite", "fwd.trasm", "-o", "f.trut", "--seed", "3", "--all"]));
    ok(&tracerw(dir.path(), &["verify", "f.trut"]));
    let out = tracerw(dir.path(), &["dump", "f.trut"]);
    ok(&out);
    let text = String::from_utf8(out.stdout).unwrap();
    assert!(text.contains(":3") && text.contains(":7"), "{text}");
}
