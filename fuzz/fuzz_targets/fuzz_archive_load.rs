#![no_main]
use libfuzzer_sys::fuzz_target;
use packfs_rs::{AccessMode, FileSystem, MemoryStream};

// Arbitrary bytes must either load or fail with an error, never panic
fuzz_target!(|data: &[u8]| {
    let Ok(mut fs) = FileSystem::load(
        "/fuzz/input.pfs",
        AccessMode::ReadWrite,
        Box::new(MemoryStream::with_data(data.to_vec())),
    ) else {
        return;
    };

    let _ = fs.verify();
    for info in fs.get_all_file_infos() {
        let _ = fs.read_file(&info.name);
    }
    let _ = fs.write_file("fuzz", b"payload");
});
