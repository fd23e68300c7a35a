//! End-to-end mount cycles over a file-backed device.

use fj_alloc::OrphanConfig;
use fj_block::{ByteBlockDevice, FileByteDevice};
use fj_core::{CoreConfig, JournalingCore, JournalingMode};
use fj_journal::{ChecksumAlgorithm, JournalConfig};
use fj_meta::{MetaConfig, MetaRecord, RecordKind, SyncMode};
use fj_recovery::RecoveryConfig;
use fj_txn::TxnConfig;
use fj_types::{BlockNumber, GroupId};
use std::sync::Arc;

const BLOCK_SIZE: u32 = 512;
const DEVICE_BLOCKS: u64 = 4096;

fn config() -> CoreConfig {
    CoreConfig {
        journal: JournalConfig {
            start_block: BlockNumber(16),
            block_count: 512,
            checksum: ChecksumAlgorithm::Blake3,
            sync_on_commit: true,
        },
        txn: TxnConfig::default(),
        meta: MetaConfig {
            region_start: BlockNumber(1024),
            region_blocks: 512,
            batch: fj_meta::BatchConfig::default(),
            cache: fj_meta::CacheConfig::default(),
        },
        orphans: OrphanConfig::default(),
        recovery: RecoveryConfig::default(),
        mode: JournalingMode::Ordered,
    }
}

fn open_device(path: &std::path::Path) -> Arc<ByteBlockDevice<FileByteDevice>> {
    let file = FileByteDevice::open(path).expect("open file device");
    Arc::new(ByteBlockDevice::new(file, BLOCK_SIZE).expect("block device"))
}

fn image() -> tempfile::NamedTempFile {
    let file = tempfile::NamedTempFile::new().expect("temp file");
    file.as_file()
        .set_len(u64::from(BLOCK_SIZE) * DEVICE_BLOCKS)
        .expect("size image");
    file
}

#[test]
fn metadata_survives_clean_remount() {
    let image = image();
    JournalingCore::format(open_device(image.path()), &config()).expect("format");

    let record = MetaRecord {
        kind: RecordKind::InodeCreate,
        entity: 42,
        payload: b"root inode".to_vec(),
    };
    {
        let core = JournalingCore::mount(open_device(image.path()), config()).expect("mount");
        core.metadata()
            .submit(record.clone(), SyncMode::Sync)
            .expect("submit");
        core.unmount().expect("unmount");
    }

    let core = JournalingCore::mount(open_device(image.path()), config()).expect("remount");
    assert!(core.recovery_report().is_none(), "clean shutdown, no recovery");
    let found = core
        .metadata()
        .lookup(42, RecordKind::InodeCreate)
        .expect("lookup")
        .expect("record present");
    assert_eq!(found, record);
    core.unmount().expect("unmount");
}

#[test]
fn crash_after_commit_recovers_on_remount() {
    let image = image();
    JournalingCore::format(open_device(image.path()), &config()).expect("format");

    {
        let core = JournalingCore::mount(open_device(image.path()), config()).expect("mount");
        core.metadata()
            .submit(
                MetaRecord {
                    kind: RecordKind::DentryCreate,
                    entity: 7,
                    payload: b"etc".to_vec(),
                },
                SyncMode::Sync,
            )
            .expect("submit");
        // No unmount: the superblock stays dirty.
    }

    let core = JournalingCore::mount(open_device(image.path()), config()).expect("remount");
    let report = core.recovery_report().expect("recovery ran");
    assert!(report.txns_replayed >= 1);

    let found = core
        .metadata()
        .lookup(7, RecordKind::DentryCreate)
        .expect("lookup")
        .expect("record survived the crash");
    assert_eq!(found.payload, b"etc");
    core.unmount().expect("unmount");
}

#[test]
fn allocations_and_admin_surface_work_end_to_end() {
    let image = image();
    JournalingCore::format(open_device(image.path()), &config()).expect("format");
    let core = JournalingCore::mount(open_device(image.path()), config()).expect("mount");

    core.allocation()
        .create_group(GroupId(0), BlockNumber(2048), 128, 32)
        .expect("group");
    let blocks = core
        .allocation()
        .alloc_blocks(GroupId(0), 8, 8, 0)
        .expect("alloc");
    assert_eq!(blocks.len(), 8);
    assert_eq!((blocks[0].0 - 2048) % 8, 0);

    let inode = core.allocation().alloc_inode(GroupId(0)).expect("inode");
    core.allocation().free_inode(inode).expect("free inode");

    core.set_mode(JournalingMode::FullData);
    let status = core.status();
    assert_eq!(status.mode, JournalingMode::FullData);
    assert!(status.sequence > 0);

    let report = core
        .allocation()
        .consistency_check(None)
        .expect("consistency");
    assert!(report.is_clean());

    let stats = core.statistics();
    assert_eq!(stats.alloc.blocks_allocated, 8);
    assert!(stats.journal.commits >= 3);
    core.unmount().expect("unmount");
}
