//! Pre-built mock host scenarios for testing.

use super::filesystem::MockFs;
use crate::collector::traits::FsUsage;

pub const KUBELET_ROOT: &str = "/var/lib/kubelet";

pub const POSTGRES_POD_UID: &str = "6f1c2a9e-8d4b-4f0e-9a55-3c1d2e7b9a01";
pub const POSTGRES_PV: &str = "pvc-1b7e4c2a-5f60-4d8e-b1a3-0c9f8e7d6a51";
pub const REDIS_POD_UID: &str = "a47d93c0-12ef-4c5b-8e6a-7f0b1c2d3e44";
pub const REDIS_PV: &str = "pvc-9e2d1f0a-3b4c-4a5d-8e7f-6a5b4c3d2e19";

/// Host path of a CSI volume's `mount` directory.
pub fn csi_mount_path(pod_uid: &str, volume: &str) -> String {
    format!(
        "{}/pods/{}/volumes/kubernetes.io~csi/{}/mount",
        KUBELET_ROOT, pod_uid, volume
    )
}

impl MockFs {
    /// Creates a Kubernetes node with two CSI-backed PVCs.
    ///
    /// - `db/postgres-0` mounts `/dev/nvme1n1` (259:1) directly.
    /// - `cache/redis-0` mounts `/dev/disk/by-id/scsi-0HC_Volume_100`, a
    ///   symlink to `/dev/sdb` (8:16); it also carries a CSI volume whose
    ///   `vol_data.json` is corrupt.
    /// - a projected service-account volume, a pod without volumes and a
    ///   stray file under `pods/`.
    pub fn kubelet_node() -> Self {
        let mut fs = Self::new();

        let pg_mount = csi_mount_path(POSTGRES_POD_UID, POSTGRES_PV);
        let redis_mount = csi_mount_path(REDIS_POD_UID, REDIS_PV);

        fs.add_file(
            "/proc/mounts",
            format!(
                "\
/dev/sda1 / ext4 rw,relatime 0 0
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
tmpfs {root}/pods/{pg}/volumes/kubernetes.io~projected/kube-api-access-7xk2p tmpfs rw,relatime,size=4096k 0 0
/dev/nvme1n1 {pg_mount} ext4 rw,relatime 0 0
/dev/disk/by-id/scsi-0HC_Volume_100 {redis_mount} xfs rw,relatime,attr2,inode64 0 0
",
                root = KUBELET_ROOT,
                pg = POSTGRES_POD_UID,
            ),
        );

        fs.add_file(
            "/proc/diskstats",
            "\
   8       0 sda 52311 1204 4187012 30110 88124 40112 6120544 120881 0 95512 151002 0 0 0 0 4410 2001
   8       1 sda1 51002 1180 4170110 29870 87011 40002 6110280 120512 0 95100 150380 0 0 0 0 0 0
   8      16 sdb 1200 10 96000 800 3400 120 272000 2600 1 3100 3400 12 0 4096 3 220 140
 259       1 nvme1n1 88211 512 7056880 44102 120455 3380 9636400 98004 2 130220 142106 310 0 2048000 55 1820 930
",
        );

        // db/postgres-0
        let pg_vol = format!(
            "{}/pods/{}/volumes/kubernetes.io~csi/{}",
            KUBELET_ROOT, POSTGRES_POD_UID, POSTGRES_PV
        );
        fs.add_dir(&pg_mount);
        fs.add_file(
            format!("{}/vol_data.json", pg_vol),
            format!(
                r#"{{"attachmentID":"csi-5d1f0c","driverName":"ebs.csi.aws.com","kubernetes.io/pod.name":"postgres-0","kubernetes.io/pod.namespace":"db","kubernetes.io/pod.uid":"{uid}","kubernetes.io/serviceAccount.name":"default","specVolID":"{pv}","volumeHandle":"vol-0a1b2c3d4e5f60718","volumeLifecycleMode":"Persistent"}}"#,
                uid = POSTGRES_POD_UID,
                pv = POSTGRES_PV,
            ),
        );
        fs.add_dir(format!(
            "{}/pods/{}/volumes/kubernetes.io~projected/kube-api-access-7xk2p",
            KUBELET_ROOT, POSTGRES_POD_UID
        ));
        fs.set_device_id(&pg_mount, 259, 1);
        fs.set_usage(
            &pg_mount,
            FsUsage {
                block_size: 4096,
                blocks: 2_621_440,
                blocks_free: 1_966_080,
                files: 655_360,
                files_free: 654_000,
            },
        );

        // cache/redis-0
        let redis_vol = format!(
            "{}/pods/{}/volumes/kubernetes.io~csi/{}",
            KUBELET_ROOT, REDIS_POD_UID, REDIS_PV
        );
        fs.add_dir(&redis_mount);
        fs.add_file(
            format!("{}/vol_data.json", redis_vol),
            format!(
                r#"{{"driverName":"csi.hetzner.cloud","kubernetes.io/pod.name":"redis-0","kubernetes.io/pod.namespace":"cache","kubernetes.io/pod.uid":"{uid}","specVolID":"{pv}","volumeHandle":"100"}}"#,
                uid = REDIS_POD_UID,
                pv = REDIS_PV,
            ),
        );
        fs.add_file(
            format!(
                "{}/pods/{}/volumes/kubernetes.io~csi/pvc-corrupt/vol_data.json",
                KUBELET_ROOT, REDIS_POD_UID
            ),
            "{\"specVolID\": \"pvc-corr",
        );
        fs.add_symlink("/dev/disk/by-id/scsi-0HC_Volume_100", "../../sdb");
        fs.set_device_id(&redis_mount, 8, 16);
        fs.set_usage(
            &redis_mount,
            FsUsage {
                block_size: 4096,
                blocks: 262_144,
                blocks_free: 200_000,
                files: 131_072,
                files_free: 131_000,
            },
        );

        // Noise
        fs.add_dir(format!(
            "{}/pods/0c5e7d21-aaaa-4bbb-8ccc-ddddeeeeffff",
            KUBELET_ROOT
        ));
        fs.add_file(format!("{}/pods/.lock", KUBELET_ROOT), "");

        fs
    }

    /// Creates a host with one mounted disk and nothing else.
    ///
    /// `/dev/sda1` (8:1) is mounted at `/mnt/pvc-1`, has completed 100 reads
    /// of 800 sectors, and its filesystem reports 1,000,000 bytes total with
    /// 400,000 free.
    pub fn single_disk() -> Self {
        let mut fs = Self::new();
        fs.add_file("/proc/mounts", "/dev/sda1 /mnt/pvc-1 ext4 rw\n");
        fs.add_file(
            "/proc/diskstats",
            "   8       1 sda1 100 0 800 50 20 0 160 30 0 70 80\n",
        );
        fs.add_dir("/mnt/pvc-1");
        fs.set_device_id("/mnt/pvc-1", 8, 1);
        fs.set_usage(
            "/mnt/pvc-1",
            FsUsage {
                block_size: 1,
                blocks: 1_000_000,
                blocks_free: 400_000,
                files: 1000,
                files_free: 990,
            },
        );
        fs
    }
}
