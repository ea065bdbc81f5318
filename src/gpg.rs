//! Invocation of the external encryption tool.
//!
//! The tool is any executable with gpg's command-line contract: it reads
//! plaintext (or one armored block) on stdin, writes the transformed bytes
//! to stdout, and exits zero on success. `GNUPGHOME` and the rest of the
//! environment pass through to the child untouched.

use std::ffi::OsString;
use std::io;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::process::Stdio;

use log::debug;

use crate::subprocess::Subprocess;
use crate::subprocess::Wire;

/// Terminator line of one armored encrypted block.
pub const ARMOR_END: &[u8] = b"-----END PGP MESSAGE-----\n";

/// Default tool, resolved through `PATH`.
const DEFAULT_BINARY: &str = "gpg";

/// A recipient identifier the external tool has vouched for.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Recipient(String);

impl Recipient {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The external tool plus the recipient set ciphertext is produced for.
#[derive(Clone, Debug)]
pub struct Gpg {
    binary: PathBuf,
    recipients: Vec<Recipient>,
}

impl Gpg {
    /// Uses `binary` as the tool, or resolves `gpg` via `PATH`.
    pub fn new(binary: Option<PathBuf>) -> Gpg {
        Gpg {
            binary: binary.unwrap_or_else(|| PathBuf::from(DEFAULT_BINARY)),
            recipients: Vec::new(),
        }
    }

    /// Rebinds an already-validated recipient set to `binary`.
    pub fn with_recipients(binary: PathBuf, recipients: Vec<Recipient>) -> Gpg {
        Gpg { binary, recipients }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn recipients(&self) -> &[Recipient] {
        &self.recipients
    }

    /// Validates `id` against the keyring (`--list-keys` with stdin and
    /// stdout on the null device) and appends it to the recipient set.
    pub fn add_recipient(&mut self, id: &str) -> io::Result<Recipient> {
        let status = Command::new(&self.binary)
            .arg("--list-keys")
            .arg(id)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .status()?;
        if !status.success() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no key found for recipient {id:?}"),
            ));
        }
        debug!("validated recipient {id:?}");
        let recipient = Recipient(id.to_owned());
        self.recipients.push(recipient.clone());
        Ok(recipient)
    }

    /// Spawns the encryptor with its stdout wired to `output`.
    pub fn spawn_encryptor(&self, output: OwnedFd) -> io::Result<Subprocess> {
        Subprocess::spawn(
            self.binary.as_os_str(),
            &self.encrypt_args(),
            Wire::Pipe,
            Wire::Fd(output),
        )
    }

    /// Spawns the decryptor reading one armored block from `input`, its
    /// stdout piped back to the caller.
    pub fn spawn_decryptor(&self, input: Wire) -> io::Result<Subprocess> {
        Subprocess::spawn(
            self.binary.as_os_str(),
            &self.decrypt_args(),
            input,
            Wire::Pipe,
        )
    }

    fn encrypt_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["--encrypt", "--armor", "--no-tty", "--batch"]
            .into_iter()
            .map(OsString::from)
            .collect();
        for recipient in &self.recipients {
            args.push(OsString::from("-r"));
            args.push(OsString::from(recipient.as_str()));
        }
        args
    }

    fn decrypt_args(&self) -> Vec<OsString> {
        ["--decrypt", "--no-tty", "--batch"]
            .into_iter()
            .map(OsString::from)
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::fs;
    use std::io::Read;
    use std::io::Seek;
    use std::io::SeekFrom;
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    /// Installs a stand-in for gpg that armors stdin with base64 and accepts
    /// any recipient starting with "test".
    pub(crate) fn stub_gpg(dir: &Path) -> PathBuf {
        let path = dir.join("stub-gpg");
        fs::write(
            &path,
            concat!(
                "#!/bin/sh\n",
                "case \"$1\" in\n",
                "  --list-keys)\n",
                "    case \"$2\" in\n",
                "      test*) exit 0 ;;\n",
                "      *) exit 1 ;;\n",
                "    esac\n",
                "    ;;\n",
                "  --encrypt)\n",
                "    printf -- '-----BEGIN PGP MESSAGE-----\\n'\n",
                "    base64\n",
                "    printf -- '-----END PGP MESSAGE-----\\n'\n",
                "    ;;\n",
                "  --decrypt)\n",
                "    grep -v -- '-----' | base64 -d\n",
                "    ;;\n",
                "  *) exit 2 ;;\n",
                "esac\n",
            ),
        )
        .unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn recipient_validation() {
        let dir = tempfile::tempdir().unwrap();
        let mut gpg = Gpg::new(Some(stub_gpg(dir.path())));
        assert!(gpg.add_recipient("test@example.com").is_ok());
        assert!(gpg.add_recipient("unknown@example.com").is_err());
        assert_eq!(gpg.recipients().len(), 1);
        assert_eq!(gpg.recipients()[0].as_str(), "test@example.com");
    }

    #[test]
    fn encrypt_args_name_every_recipient() {
        let dir = tempfile::tempdir().unwrap();
        let mut gpg = Gpg::new(Some(stub_gpg(dir.path())));
        gpg.add_recipient("test-one").unwrap();
        gpg.add_recipient("test-two").unwrap();
        let args = gpg.encrypt_args();
        assert_eq!(args[..4], ["--encrypt", "--armor", "--no-tty", "--batch"]);
        assert_eq!(args[4..], ["-r", "test-one", "-r", "test-two"]);
    }

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut gpg = Gpg::new(Some(stub_gpg(dir.path())));
        gpg.add_recipient("test-key").unwrap();

        let mut ciphertext_file = tempfile::tempfile().unwrap();
        let mut child = gpg
            .spawn_encryptor(ciphertext_file.try_clone().unwrap().into())
            .unwrap();
        child
            .communicate(Some(b"attack at dawn"), |_| Ok(()))
            .unwrap();
        assert_eq!(child.wait(), 0);

        ciphertext_file.seek(SeekFrom::Start(0)).unwrap();
        let mut ciphertext = Vec::new();
        ciphertext_file.read_to_end(&mut ciphertext).unwrap();
        assert!(ciphertext.starts_with(b"-----BEGIN PGP MESSAGE-----\n"));
        assert!(ciphertext.ends_with(ARMOR_END));
        assert!(!ciphertext.windows(14).any(|w| w == b"attack at dawn"));

        let mut child = gpg.spawn_decryptor(Wire::Pipe).unwrap();
        let mut plaintext = Vec::new();
        child
            .communicate(Some(&ciphertext), |chunk| {
                plaintext.extend_from_slice(chunk);
                Ok(())
            })
            .unwrap();
        assert_eq!(child.wait(), 0);
        assert_eq!(plaintext, b"attack at dawn");
    }
}
