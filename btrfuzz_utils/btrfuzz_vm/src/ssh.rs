use std::{
    io,
    path::Path,
    process::{Command, Stdio},
};

const SSH_OPTIONS: [&str; 10] = [
    "-F",
    "/dev/null",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "BatchMode=yes",
    "-o",
    "IdentitiesOnly=yes",
    "-o",
    "StrictHostKeyChecking=no",
];

/// `ssh` to the guest, remote command still to be appended.
pub fn ssh_basic_cmd(ip: &str, port: u16, key: &str, user: &str) -> Command {
    let mut ssh = Command::new("ssh");
    ssh.args(&SSH_OPTIONS)
        .args(&["-o", "ConnectTimeout=10s"])
        .arg("-p")
        .arg(port.to_string())
        .arg("-i")
        .arg(key)
        .arg(format!("{}@{}", user, ip));
    ssh
}

pub fn scp_cmd(ip: &str, port: u16, key: &str, user: &str, from: &Path, to: &Path) -> Command {
    let mut scp = Command::new("scp");
    scp.args(&SSH_OPTIONS)
        .arg("-P")
        .arg(port.to_string())
        .arg("-i")
        .arg(key)
        .arg(from)
        .arg(format!("{}@{}:{}", user, ip, to.display()));
    scp
}

/// Copy `from` on the host to `to` in the guest.
pub fn scp(ip: &str, port: u16, key: &str, user: &str, from: &Path, to: &Path) -> io::Result<()> {
    let output = scp_cmd(ip, port, key, user, from, to)
        .stdin(Stdio::null())
        .output()?;
    if output.status.success() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::Other,
            format!(
                "scp exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn ssh_args() {
        let mut cmd = ssh_basic_cmd("127.0.0.1", 2222, "/keys/id_rsa", "root");
        cmd.arg("pwd");
        let a = args(&cmd);
        assert_eq!(cmd.get_program(), "ssh");
        assert!(a.contains(&"BatchMode=yes".to_string()));
        assert!(a.contains(&"ConnectTimeout=10s".to_string()));
        let n = a.len();
        assert_eq!(&a[n - 6..], &["-p", "2222", "-i", "/keys/id_rsa", "root@127.0.0.1", "pwd"]);
    }

    #[test]
    fn scp_args() {
        let cmd = scp_cmd(
            "127.0.0.1",
            2222,
            "key",
            "root",
            Path::new("/bin/btrfuzz_runner"),
            Path::new("/root/btrfuzz_runner"),
        );
        let a = args(&cmd);
        assert_eq!(cmd.get_program(), "scp");
        assert!(a.contains(&"-P".to_string()));
        assert_eq!(a.last().unwrap(), "root@127.0.0.1:/root/btrfuzz_runner");
    }
}
