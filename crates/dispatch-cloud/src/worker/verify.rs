// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host key verification through a per-instance secret.
//!
//! Each instance created by the pool gets a random secret, both as a tag and
//! as a root-only file written by its init command. On the first connection
//! the executor reads the file back over the new session. A match proves the
//! host at the other end is the instance we created.

use std::sync::Arc;

use async_trait::async_trait;
use dispatch_cloud_driver::{CloudError, ExecutorTarget, HostKeyChallenge, InitCommand, Instance};
use rand::RngCore;

/// Path of the secret file on the instance.
pub const INSTANCE_SECRET_PATH: &str = "/var/run/dispatch-cloud-instance-secret";

/// Length of the secret in hex digits.
pub const INSTANCE_SECRET_LEN: usize = 40;

/// A fresh random secret of [`INSTANCE_SECRET_LEN`] hex digits.
pub fn generate_secret() -> String {
    let mut buf = [0u8; INSTANCE_SECRET_LEN / 2];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Init command that stores `secret` where [`TagVerifier`] will look.
pub fn init_command(secret: &str) -> InitCommand {
    InitCommand(format!(
        "umask 0177 && echo -n \"{}\" >{}",
        secret, INSTANCE_SECRET_PATH
    ))
}

/// Executor target that checks the instance secret.
///
/// With an empty secret (an instance created by something else) it falls
/// back to the instance's own `verify_host_key`.
pub struct TagVerifier {
    instance: Arc<dyn Instance>,
    secret: String,
}

impl TagVerifier {
    /// Wrap `instance`, expecting `secret` in its secret file.
    pub fn new(instance: Arc<dyn Instance>, secret: String) -> Self {
        Self { instance, secret }
    }
}

#[async_trait]
impl ExecutorTarget for TagVerifier {
    fn address(&self) -> Option<String> {
        self.instance.address()
    }

    fn remote_user(&self) -> String {
        self.instance.remote_user()
    }

    async fn verify_host_key(
        &self,
        host_key: &[u8],
        challenge: &dyn HostKeyChallenge,
    ) -> Result<(), CloudError> {
        if self.secret.is_empty() {
            return self.instance.verify_host_key(host_key, challenge).await;
        }
        let output = challenge
            .run(&format!("cat {}", INSTANCE_SECRET_PATH))
            .await?;
        if output != self.secret.as_bytes() {
            return Err(CloudError::HostKey(format!(
                "instance secret on {} does not match tag",
                self.instance.id()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_cloud_driver::stub::{StubDriverConfig, StubInstanceSet};
    use dispatch_cloud_driver::{ImageId, InstanceSet, InstanceSetId, InstanceTags, InstanceType};
    use tokio::sync::Mutex;

    struct FileChallenge {
        contents: Vec<u8>,
        commands: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl HostKeyChallenge for FileChallenge {
        async fn run(&self, command: &str) -> Result<Vec<u8>, CloudError> {
            self.commands.lock().await.push(command.to_string());
            Ok(self.contents.clone())
        }
    }

    async fn instance(init: InitCommand) -> Arc<dyn Instance> {
        let set = StubInstanceSet::new(
            StubDriverConfig::default(),
            InstanceSetId::from("set"),
            InstanceTags::new(),
        );
        let it = InstanceType {
            name: "small".into(),
            provider_type: "p-small".into(),
            vcpus: 1,
            ram: 1 << 30,
            scratch: 0,
            price: 0.1,
            preemptible: false,
        };
        set.create(&it, &ImageId::default(), InstanceTags::new(), init, None)
            .await
            .unwrap()
    }

    #[test]
    fn test_generate_secret() {
        let a = generate_secret();
        let b = generate_secret();
        assert_eq!(a.len(), INSTANCE_SECRET_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_init_command_writes_secret_file() {
        let cmd = init_command("abc123");
        assert_eq!(
            cmd.0,
            "umask 0177 && echo -n \"abc123\" >/var/run/dispatch-cloud-instance-secret"
        );
    }

    #[tokio::test]
    async fn test_secret_match_and_mismatch() {
        let secret = generate_secret();
        let inst = instance(init_command(&secret)).await;
        let verifier = TagVerifier::new(inst.clone(), secret.clone());

        let good = FileChallenge {
            contents: secret.as_bytes().to_vec(),
            commands: Mutex::new(Vec::new()),
        };
        verifier.verify_host_key(b"any", &good).await.unwrap();
        assert_eq!(
            good.commands.lock().await.as_slice(),
            ["cat /var/run/dispatch-cloud-instance-secret"]
        );

        let bad = FileChallenge {
            contents: b"0000".to_vec(),
            commands: Mutex::new(Vec::new()),
        };
        let err = verifier.verify_host_key(b"any", &bad).await.unwrap_err();
        assert!(matches!(err, CloudError::HostKey(_)));
    }

    #[tokio::test]
    async fn test_empty_secret_delegates_to_instance() {
        let inst = instance(InitCommand::default()).await;
        let verifier = TagVerifier::new(inst.clone(), String::new());
        let challenge = FileChallenge {
            contents: Vec::new(),
            commands: Mutex::new(Vec::new()),
        };
        let key = format!("ssh-stub {}", inst.id());
        verifier
            .verify_host_key(key.as_bytes(), &challenge)
            .await
            .unwrap();
        assert!(challenge.commands.lock().await.is_empty());
        assert!(verifier.verify_host_key(b"wrong", &challenge).await.is_err());
    }
}
