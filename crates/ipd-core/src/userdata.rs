/// Cloud-config document served to guests at both the EC2 `user-data` and
/// OpenStack `user_data` leaves. The `phone_home` hook makes the guest
/// report its address and host keys back to the metadata service on first
/// boot.
const USER_DATA: &str = "#cloud-config

hostname: {hostname}
fqdn: {hostname}.vm.ipd
manage_etc_hosts: true

phone_home:
 url: http://169.254.169.254/instancedata
 tries: 2
";

/// Render the user-data payload for an instance.
pub fn render(hostname: &str) -> String {
    USER_DATA.replace("{hostname}", hostname)
}
