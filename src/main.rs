fn main() {
    rosterd_cmd::run()
}
