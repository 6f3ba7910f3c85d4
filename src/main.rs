use csopesy::shell::Shell;
use csopesy::syslog;

fn main() {
    syslog::enable();
    Shell::new().run();
}
