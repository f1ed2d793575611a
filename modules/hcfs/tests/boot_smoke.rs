//! End-to-end boot wiring: boot modules, backends, mount table and reboot.

use hcfs::block::RamDisk;
use hcfs::config::HanaFsConfig;
use hcfs::devfs::DevFs;
use hcfs::fat32::{build_image, Fat32};
use hcfs::hanafs::HanaFs;
use hcfs::image::{BootModule, BootModules};
use hcfs::initrd;
use hcfs::mount::Vfs;
use hcfs::procfs::ProcFs;
use hcfs::FsError;

fn tar_entry(archive: &mut Vec<u8>, name: &str, typeflag: u8, data: &[u8]) {
    let mut header = vec![0u8; 512];
    header[..name.len()].copy_from_slice(name.as_bytes());
    header[124..135].copy_from_slice(format!("{:011o}", data.len()).as_bytes());
    header[156] = typeflag;
    header[257..262].copy_from_slice(b"ustar");
    archive.extend_from_slice(&header);
    archive.extend_from_slice(data);
    archive.resize(archive.len().div_ceil(512) * 512, 0);
}

fn initrd_archive() -> Vec<u8> {
    let mut archive = Vec::new();
    tar_entry(&mut archive, "dir/", b'5', b"");
    tar_entry(&mut archive, "dir/file.txt", b'0', b"from initrd\n");
    archive.resize(archive.len() + 1024, 0);
    archive
}

fn list(vfs: &Vfs, path: &str) -> Vec<String> {
    let mut out = Vec::new();
    vfs.list_dir(path, &mut |name| out.push(name.to_string())).unwrap();
    out
}

#[test]
fn boot_with_modules() {
    let mut fat_image = vec![0u8; 8192];
    build_image(&mut fat_image, &[("hello.txt", b"Hello from FAT32\n")]).unwrap();
    let archive = initrd_archive();
    let modules = BootModules::new(vec![
        BootModule {
            name: "/boot/fat32.img",
            bytes: &fat_image,
        },
        BootModule {
            name: "/boot/initrd.tar",
            bytes: &archive,
        },
    ]);

    let fat32 = Fat32::new();
    fat32.init_from_module(&modules, "fat32.img").unwrap();
    let hanafs = HanaFs::new(HanaFsConfig::default());
    hanafs.init().unwrap();
    assert_eq!(initrd::init_from_module(&modules, "initrd.tar", &hanafs), Ok(2));
    let devfs = DevFs::new();
    let procfs = ProcFs::new();

    let vfs = Vfs::default();
    vfs.attach("hanafs", &hanafs);
    vfs.attach("procfs", &procfs);
    vfs.attach("devfs", &devfs);
    vfs.attach("fat32", &fat32);
    vfs.register_mount("hanafs", "/").unwrap();
    vfs.register_mount("procfs", "/proc").unwrap();
    vfs.register_mount("devfs", "/dev").unwrap();
    vfs.register_mount("fat32", "/fat").unwrap();
    procfs.set_mounts(&vfs.render_mounts());

    assert_eq!(list(&vfs, "/"), ["dir"]);
    assert_eq!(list(&vfs, "/dir"), ["file.txt"]);
    assert_eq!(vfs.read_file("/dir/file.txt").unwrap(), b"from initrd\n");
    assert_eq!(list(&vfs, "/fat"), ["hello.txt"]);
    assert_eq!(vfs.read_file("/fat/HELLO.TXT").unwrap(), b"Hello from FAT32\n");
    assert_eq!(vfs.read_file("/dev/console").unwrap(), b"console\n");
    let mounts = String::from_utf8(vfs.read_file("/proc/mounts").unwrap()).unwrap();
    assert_eq!(mounts.lines().count(), 4);
    assert!(mounts.contains("VFS mount: [fat32 -> /fat]"));
    assert_eq!(vfs.read_file("/fat/missing.txt"), Err(FsError::NotFound));
}

#[test]
fn hanafs_survives_reboot() {
    let disk = RamDisk::new(4096);
    {
        let hanafs = HanaFs::with_device(&disk, HanaFsConfig::default());
        hanafs.init().unwrap();
        let vfs = Vfs::default();
        vfs.attach("hanafs", &hanafs);
        vfs.make_dir("/home").unwrap();
        vfs.write_file("/home/notes.txt", b"remember me").unwrap();
        hanafs.persist_to_block_device().unwrap();
    }

    let hanafs = HanaFs::with_device(&disk, HanaFsConfig::default());
    hanafs.init().unwrap();
    let vfs = Vfs::default();
    vfs.attach("hanafs", &hanafs);
    assert_eq!(list(&vfs, "/home"), ["notes.txt"]);
    assert_eq!(vfs.read_file("/home/notes.txt").unwrap(), b"remember me");
    assert_eq!(vfs.metadata("/home/notes.txt").unwrap().size, 11);
}
