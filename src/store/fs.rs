use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::store::{Artifact, Store, StoreKey};

/// Sidecar written next to the payloads of one task instance, so the cache
/// directory stays inspectable: signature hashes are one-way, the manifest
/// keeps the full text.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    kind: String,
    signature: String,
    outputs: Vec<String>,
}

/// A file-backed completion store.
///
/// Layout: `<root>/<kind>/<blake3(signature)>/<output>.bin`, with a
/// `manifest.cbor` sidecar per instance directory. The key triple maps to a
/// deterministic path, which is what makes reruns free across process
/// restarts. Saves go through a temp file and a rename, so a key is either
/// absent or holds a complete payload.
#[derive(Debug)]
pub struct FsStore {
    root: Utf8PathBuf,
    manifests: Mutex<()>,
}

impl FsStore {
    pub fn new(root: impl AsRef<Utf8Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            manifests: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn dir(&self, key: &StoreKey) -> Utf8PathBuf {
        self.root
            .join(key.kind())
            .join(key.signature().digest().to_hex())
    }

    fn path(&self, key: &StoreKey) -> Utf8PathBuf {
        self.dir(key).join(format!("{}.bin", key.output()))
    }

    /// Manifest updates are read-modify-write; concurrent saves of
    /// different outputs of one instance must not lose each other's entry.
    fn write_manifest(&self, dir: &Utf8Path, key: &StoreKey) -> Result<(), StoreError> {
        let _guard = self.manifests.lock().unwrap();
        let path = dir.join("manifest.cbor");

        let mut manifest = match File::open(&path) {
            Ok(file) => ciborium::from_reader(BufReader::new(file)).unwrap_or_default(),
            Err(_) => Manifest::default(),
        };

        manifest.kind = key.kind().to_string();
        manifest.signature = key.signature().text().to_string();
        if !manifest.outputs.iter().any(|name| name == key.output()) {
            manifest.outputs.push(key.output().to_string());
            manifest.outputs.sort_unstable();
        }

        let temp = dir.join(format!(".manifest.{}.tmp", key.output()));
        ciborium::into_writer(&manifest, BufWriter::new(File::create(&temp)?))?;
        fs::rename(&temp, &path)?;

        Ok(())
    }
}

impl Store for FsStore {
    fn exists(&self, key: &StoreKey) -> Result<bool, StoreError> {
        Ok(self.path(key).is_file())
    }

    fn load(&self, key: &StoreKey) -> Result<Artifact, StoreError> {
        match fs::read(self.path(key)) {
            Ok(bytes) => Ok(Artifact::from_bytes(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    fn save(&self, key: &StoreKey, artifact: &Artifact) -> Result<(), StoreError> {
        let dir = self.dir(key);
        fs::create_dir_all(&dir)?;

        let temp = dir.join(format!(".{}.bin.tmp", key.output()));
        fs::write(&temp, artifact.bytes())?;
        fs::rename(&temp, self.path(key))?;

        self.write_manifest(&dir, key)?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::param::{self, ParamKind, ParamSpec};
    use crate::task::TaskInstance;

    fn instance() -> TaskInstance {
        let specs = [ParamSpec {
            name: "lookback".into(),
            kind: ParamKind::Int,
            default: None,
        }];
        let params = param::validate(&specs, [("lookback".into(), 1.into())]).unwrap();
        TaskInstance::new("signal".into(), params)
    }

    #[test]
    fn test_roundtrip_and_layout() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let store = FsStore::new(root);

        let instance = instance();
        let key = StoreKey::new(&instance, "weights");

        assert!(!store.exists(&key).unwrap());
        store.save(&key, &Artifact::from_bytes(vec![7u8, 8])).unwrap();
        assert!(store.exists(&key).unwrap());
        assert_eq!(store.load(&key).unwrap().bytes(), &[7, 8]);

        let payload = root
            .join("signal")
            .join(instance.signature().digest().to_hex())
            .join("weights.bin");
        assert!(payload.is_file());
        assert!(payload.parent().unwrap().join("manifest.cbor").is_file());
    }

    #[test]
    fn test_missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(Utf8Path::from_path(dir.path()).unwrap());

        let key = StoreKey::new(&instance(), "weights");
        assert!(matches!(store.load(&key), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_concurrent_saves_keep_every_manifest_entry() {
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let store = Arc::new(FsStore::new(root));

        let instance = instance();
        let workers: Vec<_> = ["portfolio", "pnl", "trades", "turnover"]
            .into_iter()
            .map(|output| {
                let store = store.clone();
                let key = StoreKey::new(&instance, output);
                std::thread::spawn(move || {
                    for round in 0..20u8 {
                        store.save(&key, &Artifact::from_bytes(vec![round])).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let path = root
            .join("signal")
            .join(instance.signature().digest().to_hex())
            .join("manifest.cbor");
        let manifest: Manifest =
            ciborium::from_reader(BufReader::new(File::open(path).unwrap())).unwrap();
        assert_eq!(
            manifest.outputs,
            vec!["pnl", "portfolio", "trades", "turnover"]
        );
    }

    #[test]
    fn test_manifest_accumulates_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let store = FsStore::new(root);

        let instance = instance();
        for output in ["portfolio", "pnl", "portfolio"] {
            let key = StoreKey::new(&instance, output);
            store.save(&key, &Artifact::from_bytes(vec![0u8])).unwrap();
        }

        let path = root
            .join("signal")
            .join(instance.signature().digest().to_hex())
            .join("manifest.cbor");
        let manifest: Manifest =
            ciborium::from_reader(BufReader::new(File::open(path).unwrap())).unwrap();

        assert_eq!(manifest.kind, "signal");
        assert_eq!(manifest.signature, "lookback=1");
        assert_eq!(manifest.outputs, vec!["pnl", "portfolio"]);
    }
}
