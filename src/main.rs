use std::io::ErrorKind;
use std::path::PathBuf;

use asymmetricfs::AccessMode;
use asymmetricfs::AsymmetricFs;
use asymmetricfs::AsymmetricFuse;
use asymmetricfs::Gpg;
use asymmetricfs::MemoryLock;
use clap::Arg;
use clap::ArgAction;
use clap::ArgGroup;
use clap::Command;
use clap::crate_version;
use fuser::MountOption;
use log::LevelFilter;
use log::error;
use nix::sys::mman::MlockAllFlags;
use nix::sys::mman::mlockall;
use nix::sys::resource::Resource;
use nix::sys::resource::setrlimit;

fn main() {
    let matches = Command::new("asymmetricfs")
        .version(crate_version!())
        .about("Mounts an encrypting overlay over a backing directory")
        .arg(
            Arg::new("rw")
                .long("rw")
                .action(ArgAction::SetTrue)
                .help("Mount read-write: reads decrypt on demand"),
        )
        .arg(
            Arg::new("wo")
                .long("wo")
                .action(ArgAction::SetTrue)
                .help("Mount write-only: reads are denied"),
        )
        .group(ArgGroup::new("mode").args(["rw", "wo"]).required(true))
        .arg(
            Arg::new("recipient")
                .short('r')
                .long("recipient")
                .action(ArgAction::Append)
                .required(true)
                .value_name("KEY")
                .help("Encrypt to this recipient (repeatable)"),
        )
        .arg(
            Arg::new("gpg-binary")
                .long("gpg-binary")
                .value_name("PATH")
                .help("External encryption tool (default: gpg, resolved via PATH)"),
        )
        .arg(
            Arg::new("memory-lock")
                .long("memory-lock")
                .value_parser(["all", "buffers", "none"])
                .default_value("none")
                .help("Which plaintext pages to lock into RAM"),
        )
        .arg(
            Arg::new("enable-core-dumps")
                .long("enable-core-dumps")
                .action(ArgAction::SetTrue)
                .help("Leave RLIMIT_CORE alone instead of zeroing it"),
        )
        .arg(
            Arg::new("allow-other")
                .long("allow-other")
                .action(ArgAction::SetTrue)
                .help("Allow other users to access the mount"),
        )
        .arg(
            Arg::new("auto-unmount")
                .long("auto-unmount")
                .action(ArgAction::SetTrue)
                .help("Automatically unmount when the process exits"),
        )
        .arg(
            Arg::new("v")
                .short('v')
                .action(ArgAction::Count)
                .help("Sets the level of verbosity"),
        )
        .arg(
            Arg::new("target")
                .required(true)
                .help("Backing directory that holds the ciphertext"),
        )
        .arg(
            Arg::new("mount-point")
                .required(true)
                .help("Where to mount the plaintext view"),
        )
        .get_matches();

    let verbosity = matches.get_count("v");
    let log_level = match verbosity {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::builder()
        .format_timestamp_nanos()
        .filter_level(log_level)
        .init();

    // An encryptor child can die mid-pipe; that must surface as EPIPE on
    // the write, not kill the whole mount.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    if !matches.get_flag("enable-core-dumps") {
        // A core file would spill every buffered plaintext to disk.
        if let Err(err) = setrlimit(Resource::RLIMIT_CORE, 0, 0) {
            error!("disabling core dumps failed: {err}");
            std::process::exit(1);
        }
    }

    let memory_lock: MemoryLock = matches
        .get_one::<String>("memory-lock")
        .unwrap()
        .parse()
        .unwrap();
    if memory_lock == MemoryLock::All {
        if let Err(err) = mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE) {
            error!("memory-lock=all: mlockall failed: {err}");
            std::process::exit(1);
        }
    }

    let mode = if matches.get_flag("rw") {
        AccessMode::ReadWrite
    } else {
        AccessMode::WriteOnly
    };

    let mut gpg = Gpg::new(matches.get_one::<String>("gpg-binary").map(PathBuf::from));
    for recipient in matches.get_many::<String>("recipient").unwrap() {
        if let Err(err) = gpg.add_recipient(recipient) {
            error!("recipient {recipient:?} rejected: {err}");
            std::process::exit(1);
        }
    }

    let target = PathBuf::from(matches.get_one::<String>("target").unwrap());
    let mount_point = matches.get_one::<String>("mount-point").unwrap();

    let fs = match AsymmetricFs::new(&target, mode, memory_lock, gpg) {
        Ok(fs) => fs,
        Err(err) => {
            error!("cannot open backing directory {target:?}: {err}");
            std::process::exit(1);
        }
    };

    let mut options = vec![MountOption::FSName("asymmetricfs".to_string())];
    if matches.get_flag("allow-other") {
        options.push(MountOption::AllowOther);
    }
    if matches.get_flag("auto-unmount") {
        options.push(MountOption::AutoUnmount);
    }

    let result = fuser::mount2(AsymmetricFuse::new(fs), mount_point, &options);
    if let Err(err) = result {
        // A permission error here usually means "user_allow_other" is
        // missing from /etc/fuse.conf
        if err.kind() == ErrorKind::PermissionDenied {
            error!("{err}");
            std::process::exit(2);
        }
        error!("{err}");
    }
}
