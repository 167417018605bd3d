use blitzseal::compress::Codec;
use blitzseal::crypto::Kdf;
use blitzseal::{channel_sink, Dispatcher, Event, JobConfig};
use crossbeam_channel::{unbounded, Receiver};
use rand::{thread_rng, Rng};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::tempdir;

// ---------- helpers ----------
fn create_text_data(dir: &Path, num_files: usize, lines: usize) -> std::io::Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)?;
    let mut paths = Vec::new();
    let mut rng = thread_rng();
    for i in 0..num_files {
        let file_path = dir.join(format!("doc_{}.log", i));
        let mut file = File::create(&file_path)?;
        for line in 0..lines {
            writeln!(file, "{line:08} level=INFO worker={} msg=request served", rng.gen_range(0..8))?;
        }
        paths.push(file_path);
    }
    Ok(paths)
}

fn create_random_file(path: &Path, size: usize) -> std::io::Result<()> {
    let mut buf = vec![0u8; size];
    thread_rng().fill(&mut buf[..]);
    fs::write(path, buf)
}

fn config(codec: Codec) -> JobConfig {
    JobConfig {
        codec,
        kdf: Kdf::Pbkdf2Sha256 { rounds: 1000 },
        ..JobConfig::with_passphrase("pw")
    }
}

fn completed(rx: &Receiver<Event>, jobs: usize) -> Vec<PathBuf> {
    let mut done = Vec::new();
    while done.len() < jobs {
        match rx.recv_timeout(Duration::from_secs(60)).expect("timed out") {
            Event::Completed { id, output } => done.push((id, output)),
            event if event.is_terminal() => panic!("job did not complete: {event:?}"),
            _ => {}
        }
    }
    done.sort();
    done.into_iter().map(|(_, p)| p).collect()
}

fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn round_trip(codec: Codec) {
    let src = tempdir().unwrap();
    let sealed = tempdir().unwrap();
    let restored = tempdir().unwrap();
    let inputs = create_text_data(src.path(), 3, 5000).unwrap();

    let (tx, rx) = unbounded();
    let dispatcher = Dispatcher::new(2, channel_sink(tx)).unwrap().with_chunk_size(16 * 1024);
    let jobs = dispatcher
        .encrypt_batch(config(codec), &inputs, Some(sealed.path()))
        .unwrap();
    let enc = completed(&rx, jobs);

    let expected: Vec<String> = (0..3)
        .map(|i| format!("doc_{i}.log{}.enc", codec.suffix()))
        .collect();
    assert_eq!(file_names(sealed.path()), expected, "intermediates must be removed");
    for (input, enc) in inputs.iter().zip(&enc) {
        let plain = fs::metadata(input).unwrap().len();
        let packed = fs::metadata(enc).unwrap().len();
        assert!(packed < plain / 3, "{codec:?}: {packed} vs {plain}");
    }

    dispatcher.wait_idle();
    let jobs = dispatcher
        .decrypt_batch(config(codec), &enc, Some(restored.path()))
        .unwrap();
    let plain = completed(&rx, jobs);
    assert_eq!(file_names(restored.path()), vec!["doc_0.log", "doc_1.log", "doc_2.log"]);
    for (input, output) in inputs.iter().zip(&plain) {
        assert_eq!(fs::read(input).unwrap(), fs::read(output).unwrap());
    }
}

#[test]
fn zstd_round_trip() {
    round_trip(Codec::Zstd { level: 3 });
}

#[test]
fn xz_round_trip() {
    round_trip(Codec::Xz { preset: 1 });
}

#[test]
fn keep_intermediate_leaves_compressed_file() {
    let src = tempdir().unwrap();
    let out = tempdir().unwrap();
    let inputs = create_text_data(src.path(), 1, 200).unwrap();

    let mut cfg = config(Codec::default());
    cfg.remove_intermediate = false;

    let (tx, rx) = unbounded();
    let dispatcher = Dispatcher::new(1, channel_sink(tx)).unwrap();
    let jobs = dispatcher.encrypt_batch(cfg, &inputs, Some(out.path())).unwrap();
    completed(&rx, jobs);
    assert_eq!(file_names(out.path()), vec!["doc_0.log.zst", "doc_0.log.zst.enc"]);
}

#[test]
fn incompressible_and_empty_inputs_survive() {
    let src = tempdir().unwrap();
    let sealed = tempdir().unwrap();
    let restored = tempdir().unwrap();
    let noise = src.path().join("noise.bin");
    let empty = src.path().join("empty.bin");
    create_random_file(&noise, 300_000).unwrap();
    File::create(&empty).unwrap();
    let inputs = vec![noise, empty];

    let (tx, rx) = unbounded();
    let dispatcher = Dispatcher::new(2, channel_sink(tx)).unwrap();
    let jobs = dispatcher
        .encrypt_batch(config(Codec::default()), &inputs, Some(sealed.path()))
        .unwrap();
    let enc = completed(&rx, jobs);

    dispatcher.wait_idle();
    let jobs = dispatcher
        .decrypt_batch(config(Codec::default()), &enc, Some(restored.path()))
        .unwrap();
    let plain = completed(&rx, jobs);
    for (input, output) in inputs.iter().zip(&plain) {
        assert_eq!(fs::read(input).unwrap(), fs::read(output).unwrap());
    }
}

#[test]
fn colliding_names_get_copy_suffixes() {
    let a = tempdir().unwrap();
    let b = tempdir().unwrap();
    let out = tempdir().unwrap();
    fs::write(a.path().join("same.txt"), "from a").unwrap();
    fs::write(b.path().join("same.txt"), "from b").unwrap();
    fs::write(out.path().join("same.txt.zst.enc"), "already here").unwrap();

    let inputs = vec![a.path().join("same.txt"), b.path().join("same.txt")];
    let (tx, rx) = unbounded();
    let dispatcher = Dispatcher::new(2, channel_sink(tx)).unwrap();
    let jobs = dispatcher
        .encrypt_batch(config(Codec::default()), &inputs, Some(out.path()))
        .unwrap();
    let enc = completed(&rx, jobs);

    assert_eq!(fs::read(out.path().join("same.txt.zst.enc")).unwrap(), b"already here");
    assert_eq!(enc[0], out.path().join("same.txt.zst copy.enc"));
    // The second intermediate became "same.txt copy.zst", which names its own output.
    assert_eq!(enc[1], out.path().join("same.txt copy.zst.enc"));
}
