#![no_main]
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use packfs_rs::{AccessMode, FileSystem, MemoryStream};

#[derive(Arbitrary, Debug)]
enum Op {
    Write { name: u8, len: u16 },
    Delete { name: u8 },
    Rename { from: u8, to: u8 },
    Segment { name: u8, offset: u16, len: u16 },
}

fuzz_target!(|ops: Vec<Op>| {
    let mut fs = FileSystem::create(
        "/fuzz/ops.pfs",
        AccessMode::ReadWrite,
        Box::new(MemoryStream::new()),
        8,
        16,
    )
    .unwrap();

    for op in ops {
        match op {
            Op::Write { name, len } => {
                let _ = fs.write_file(&format!("f{}", name % 12), &vec![name; len as usize]);
            }
            Op::Delete { name } => {
                let _ = fs.delete_file(&format!("f{}", name % 12));
            }
            Op::Rename { from, to } => {
                let _ = fs.rename_file(&format!("f{}", from % 12), &format!("f{}", to % 12));
            }
            Op::Segment { name, offset, len } => {
                let _ = fs.read_file_segment(&format!("f{}", name % 12), offset as u64, len as u64);
            }
        }
        fs.verify().unwrap();
    }
});
